// =============================================================================
// MESH - Vertex layout and OBJ loading
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::{offset_of, size_of};
use std::path::Path;

/// Interleaved vertex as the vertex shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }

    /// Bit pattern used to find identical vertices
    fn key(&self) -> [u32; 8] {
        bytemuck::cast(*self)
    }
}

/// Deduplicated triangle list
#[derive(Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Load a Wavefront OBJ file. Materials are ignored.
    pub fn load_obj(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open model {:?}", path))?;
        let mut reader = BufReader::new(file);

        let mesh =
            Self::parse_obj(&mut reader).with_context(|| format!("Failed to load model {:?}", path))?;

        log::info!(
            "Loaded model {:?}: {} vertices, {} indices",
            path,
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok(mesh)
    }

    /// Parse OBJ text, triangulating faces and merging identical vertices
    pub fn parse_obj<R: BufRead>(reader: &mut R) -> Result<Self> {
        let (models, _) = tobj::load_obj_buf(reader, &tobj::GPU_LOAD_OPTIONS, |_| {
            Ok(Default::default())
        })?;

        let mut mesh = Mesh::default();
        let mut unique_vertices: HashMap<[u32; 8], u32> = HashMap::new();

        for model in &models {
            let positions = &model.mesh.positions;
            let texcoords = &model.mesh.texcoords;
            if !texcoords.is_empty() && texcoords.len() / 2 != positions.len() / 3 {
                log::warn!(
                    "Object '{}' mixes faces with and without texture coordinates",
                    model.name
                );
            }

            for &index in &model.mesh.indices {
                let index = index as usize;

                // Faces without texture coordinates may sit next to faces with
                // them, leaving the array shorter than the positions
                let tex_coord = match texcoords.get(2 * index..2 * index + 2) {
                    // OBJ puts the texture origin bottom-left, Vulkan top-left
                    Some(&[u, v]) => [u, 1.0 - v],
                    _ => [0.0, 0.0],
                };

                let vertex = Vertex {
                    position: [
                        positions[3 * index],
                        positions[3 * index + 1],
                        positions[3 * index + 2],
                    ],
                    color: [1.0, 1.0, 1.0],
                    tex_coord,
                };

                let next = mesh.vertices.len() as u32;
                let shared = *unique_vertices.entry(vertex.key()).or_insert_with(|| {
                    mesh.vertices.push(vertex);
                    next
                });
                mesh.indices.push(shared);
            }
        }

        if mesh.indices.is_empty() {
            anyhow::bail!("Model contains no triangles");
        }

        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const QUAD: &str = "\
v -0.5 -0.5 0.0
v 0.5 -0.5 0.0
v 0.5 0.5 0.0
v -0.5 0.5 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    fn parse(text: &str) -> Result<Mesh> {
        Mesh::parse_obj(&mut Cursor::new(text.as_bytes()))
    }

    #[test]
    fn vertex_layout_matches_shader() {
        assert_eq!(size_of::<Vertex>(), 32);

        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 32);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);

        let attributes = Vertex::attribute_descriptions();
        let layout: Vec<_> = attributes
            .iter()
            .map(|a| (a.location, a.format, a.offset))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, vk::Format::R32G32B32_SFLOAT, 0),
                (1, vk::Format::R32G32B32_SFLOAT, 12),
                (2, vk::Format::R32G32_SFLOAT, 24),
            ]
        );
    }

    #[test]
    fn quad_is_triangulated() {
        let mesh = parse(QUAD).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.indices.iter().all(|&i| i < 4));
        assert!(mesh.vertices.iter().all(|v| v.color == [1.0, 1.0, 1.0]));
    }

    #[test]
    fn texture_v_is_flipped() {
        let mesh = parse(QUAD).unwrap();
        let at = |position: [f32; 3]| {
            mesh.vertices
                .iter()
                .find(|v| v.position == position)
                .map(|v| v.tex_coord)
                .unwrap()
        };
        assert_eq!(at([-0.5, -0.5, 0.0]), [0.0, 1.0]);
        assert_eq!(at([0.5, 0.5, 0.0]), [1.0, 0.0]);
    }

    #[test]
    fn identical_vertices_are_shared() {
        // The same triangle in two objects
        let mesh = parse(
            "\
v 0 0 0
v 1 0 0
v 0 1 0
o first
f 1 2 3
o second
f 1 2 3
",
        )
        .unwrap();

        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn missing_texcoords_default_to_zero() {
        let mesh = parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        assert!(mesh.vertices.iter().all(|v| v.tex_coord == [0.0, 0.0]));
    }

    #[test]
    fn mixed_texcoords_default_to_zero() {
        // Second face has no texture coordinates and adds a fourth position
        let mesh = parse(
            "\
v 0 0 0
v 1 0 0
v 0 1 0
v 1 1 0
vt 0 0
vt 1 0
vt 0 1
f 1/1 2/2 3/3
f 2 4 3
",
        )
        .unwrap();

        assert_eq!(mesh.indices.len(), 6);
        let corner = mesh
            .vertices
            .iter()
            .find(|v| v.position == [1.0, 1.0, 0.0])
            .unwrap();
        assert_eq!(corner.tex_coord, [0.0, 0.0]);

        let origin = mesh
            .vertices
            .iter()
            .find(|v| v.position == [0.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(origin.tex_coord, [0.0, 1.0]);
    }

    #[test]
    fn empty_model_is_an_error() {
        assert!(parse("# nothing here\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Mesh::load_obj(Path::new("assets/models/missing.obj")).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.obj"));
    }
}
