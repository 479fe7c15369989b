use crate::renderer::device::Dev;
use anyhow::{anyhow, bail, ensure, Context, Result};
use ash::vk;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

pub const MAX_SETS: usize = 8;
pub const MAX_BINDINGS_PER_SET: usize = 16;
pub const MAX_PUSH_RANGES: usize = 4;

/// One descriptor binding as reconstructed from a SPIR-V module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Reflection record of a loaded SPIR-V module: stage, descriptor-set
/// bindings, push-constant ranges. Records of stages targeting one pipeline
/// are merged before layout creation.
#[derive(Clone, Debug, Default)]
pub struct ShaderReflect {
    pub stage: vk::ShaderStageFlags,
    pub sets: Vec<Vec<BindingDesc>>,
    pub push_ranges: Vec<vk::PushConstantRange>,
    pub local_size: [u32; 3],
}

// SPIR-V opcodes and enums used by the walker, core 1.0 only.
const OP_ENTRY_POINT: u32 = 15;
const OP_EXECUTION_MODE: u32 = 16;
const OP_TYPE_INT: u32 = 21;
const OP_TYPE_FLOAT: u32 = 22;
const OP_TYPE_VECTOR: u32 = 23;
const OP_TYPE_MATRIX: u32 = 24;
const OP_TYPE_IMAGE: u32 = 25;
const OP_TYPE_SAMPLER: u32 = 26;
const OP_TYPE_SAMPLED_IMAGE: u32 = 27;
const OP_TYPE_ARRAY: u32 = 28;
const OP_TYPE_STRUCT: u32 = 30;
const OP_TYPE_POINTER: u32 = 32;
const OP_CONSTANT: u32 = 43;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;

const EXECUTION_MODEL_VERTEX: u32 = 0;
const EXECUTION_MODEL_FRAGMENT: u32 = 4;
const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_INPUT_ATTACHMENT_INDEX: u32 = 43;

const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_PUSH_CONSTANT: u32 = 9;
const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, Default)]
struct SpirvId {
    opcode: u32,
    type_id: u32,
    storage_class: u32,
    set: u32,
    binding: u32,
    input_attachment_index: Option<u32>,
    struct_decoration: u32,
    width: u32,
    component_type: u32,
    component_count: u32,
    array_element: u32,
    array_length_id: u32,
    constant_value: u32,
    member_types: Vec<u32>,
}

/// Walks a SPIR-V module's id table and classifies every `OpVariable` by its
/// storage class and pointee type. Core 1.0 encoding only.
pub fn reflect_spirv(code: &[u32]) -> Result<ShaderReflect> {
    ensure!(
        code.len() > 5 && code[0] == SPIRV_MAGIC,
        "code is not valid SPIR-V"
    );
    let id_bound = code[3] as usize;
    let mut ids = vec![SpirvId::default(); id_bound];
    let mut reflect = ShaderReflect {
        local_size: [1, 1, 1],
        ..ShaderReflect::default()
    };

    let mut cursor = 5;
    while cursor < code.len() {
        let opcode = code[cursor] & 0xffff;
        let word_count = (code[cursor] >> 16) as usize;
        ensure!(word_count > 0 && cursor + word_count <= code.len(), "truncated SPIR-V");
        let ins = &code[cursor..cursor + word_count];
        match opcode {
            OP_ENTRY_POINT => {
                reflect.stage = match ins[1] {
                    EXECUTION_MODEL_VERTEX => vk::ShaderStageFlags::VERTEX,
                    EXECUTION_MODEL_FRAGMENT => vk::ShaderStageFlags::FRAGMENT,
                    EXECUTION_MODEL_GL_COMPUTE => vk::ShaderStageFlags::COMPUTE,
                    model => bail!("unsupported execution model {model}"),
                };
            }
            OP_EXECUTION_MODE => {
                if ins[2] == EXECUTION_MODE_LOCAL_SIZE {
                    reflect.local_size = [ins[3], ins[4], ins[5]];
                }
            }
            OP_DECORATE => {
                let id = &mut ids[ins[1] as usize];
                match ins[2] {
                    DECORATION_DESCRIPTOR_SET => id.set = ins[3],
                    DECORATION_BINDING => id.binding = ins[3],
                    DECORATION_BLOCK | DECORATION_BUFFER_BLOCK => id.struct_decoration = ins[2],
                    DECORATION_INPUT_ATTACHMENT_INDEX => id.input_attachment_index = Some(ins[3]),
                    _ => {}
                }
            }
            OP_TYPE_STRUCT => {
                let id = &mut ids[ins[1] as usize];
                id.opcode = opcode;
                id.member_types = ins[2..].to_vec();
            }
            OP_TYPE_IMAGE | OP_TYPE_SAMPLER | OP_TYPE_SAMPLED_IMAGE => {
                ids[ins[1] as usize].opcode = opcode;
            }
            OP_TYPE_INT | OP_TYPE_FLOAT => {
                let id = &mut ids[ins[1] as usize];
                id.opcode = opcode;
                id.width = ins[2];
            }
            OP_TYPE_VECTOR | OP_TYPE_MATRIX => {
                let id = &mut ids[ins[1] as usize];
                id.opcode = opcode;
                id.component_type = ins[2];
                id.component_count = ins[3];
            }
            OP_TYPE_ARRAY => {
                let id = &mut ids[ins[1] as usize];
                id.opcode = opcode;
                id.array_element = ins[2];
                id.array_length_id = ins[3];
            }
            OP_TYPE_POINTER => {
                let id = &mut ids[ins[1] as usize];
                id.opcode = opcode;
                id.storage_class = ins[2];
                id.type_id = ins[3];
            }
            OP_VARIABLE => {
                let id = &mut ids[ins[2] as usize];
                id.opcode = opcode;
                id.type_id = ins[1];
                id.storage_class = ins[3];
            }
            OP_CONSTANT => {
                let id = &mut ids[ins[2] as usize];
                id.opcode = opcode;
                id.constant_value = ins[3];
            }
            _ => {}
        }
        cursor += word_count;
    }

    for index in 0..id_bound {
        let id = &ids[index];
        if id.opcode != OP_VARIABLE {
            continue;
        }
        match id.storage_class {
            STORAGE_CLASS_UNIFORM | STORAGE_CLASS_UNIFORM_CONSTANT | STORAGE_CLASS_STORAGE_BUFFER => {
                ensure!((id.set as usize) < MAX_SETS, "descriptor set {} out of range", id.set);
                ensure!(
                    (id.binding as usize) < MAX_BINDINGS_PER_SET,
                    "descriptor binding {} out of range",
                    id.binding
                );
                let pointer = &ids[id.type_id as usize];
                ensure!(pointer.opcode == OP_TYPE_POINTER, "variable type is not a pointer");
                let pointee = &ids[pointer.type_id as usize];
                let descriptor_type = match pointee.opcode {
                    OP_TYPE_STRUCT => match pointee.struct_decoration {
                        DECORATION_BLOCK if id.storage_class == STORAGE_CLASS_STORAGE_BUFFER => {
                            vk::DescriptorType::STORAGE_BUFFER
                        }
                        DECORATION_BLOCK => vk::DescriptorType::UNIFORM_BUFFER,
                        DECORATION_BUFFER_BLOCK => vk::DescriptorType::STORAGE_BUFFER,
                        _ => bail!("struct binding without block decoration"),
                    },
                    OP_TYPE_IMAGE => {
                        if id.input_attachment_index.is_some() {
                            vk::DescriptorType::INPUT_ATTACHMENT
                        } else {
                            vk::DescriptorType::STORAGE_IMAGE
                        }
                    }
                    OP_TYPE_SAMPLER => vk::DescriptorType::SAMPLER,
                    OP_TYPE_SAMPLED_IMAGE => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    opcode => bail!("unknown resource type, pointee opcode {opcode}"),
                };
                if reflect.sets.len() <= id.set as usize {
                    reflect.sets.resize(id.set as usize + 1, Vec::new());
                }
                reflect.sets[id.set as usize].push(BindingDesc {
                    binding: id.binding,
                    descriptor_type,
                    count: 1,
                    stages: reflect.stage,
                });
            }
            STORAGE_CLASS_PUSH_CONSTANT => {
                ensure!(
                    reflect.push_ranges.len() < MAX_PUSH_RANGES,
                    "too many push-constant ranges"
                );
                let pointer = &ids[id.type_id as usize];
                let size = type_size(&ids, pointer.type_id as usize, 0)?;
                reflect.push_ranges.push(
                    vk::PushConstantRange::default()
                        .stage_flags(reflect.stage)
                        .offset(0)
                        .size(size),
                );
            }
            _ => {}
        }
    }
    for set in &mut reflect.sets {
        set.sort_by_key(|binding| binding.binding);
    }
    Ok(reflect)
}

/// Size contribution of a type appended at `current_size`, including the
/// padding its std140 base alignment requires.
fn type_size(ids: &[SpirvId], id: usize, current_size: u32) -> Result<u32> {
    let (size, alignment) = match ids[id].opcode {
        OP_TYPE_FLOAT | OP_TYPE_INT => return Ok(ids[id].width / 8),
        OP_TYPE_VECTOR => {
            let component = type_size(ids, ids[id].component_type as usize, 0)?;
            let size = ids[id].component_count * component;
            // Two-component vectors align to 2N, three- and four-component
            // ones to 4N.
            let alignment = ids[id].component_count.next_multiple_of(2) * component;
            (size, alignment)
        }
        OP_TYPE_MATRIX => {
            let column_id = ids[id].component_type as usize;
            let column = type_size(ids, column_id, 0)?;
            let element = type_size(ids, ids[column_id].component_type as usize, 0)?;
            let alignment = ids[column_id].component_count.next_multiple_of(2) * element;
            (ids[id].component_count * column, alignment)
        }
        OP_TYPE_ARRAY => {
            let length = ids[ids[id].array_length_id as usize].constant_value;
            let element = type_size(ids, ids[id].array_element as usize, 0)?;
            let stride = element.next_multiple_of(16);
            (length * stride, stride)
        }
        OP_TYPE_STRUCT => {
            let mut offset = 0;
            let mut alignment = 0;
            for &member in &ids[id].member_types {
                let member_size = type_size(ids, member as usize, offset)?;
                offset += member_size;
                alignment = alignment.max(member_size);
            }
            (offset, alignment.max(1))
        }
        opcode => bail!("cannot size type with opcode {opcode}"),
    };
    Ok(current_size.next_multiple_of(alignment) - current_size + size)
}

/// Union of two stage reflections targeting one pipeline: bindings merge
/// with ORed stage flags, conflicting (binding, descriptorType) pairs are a
/// diagnostic.
pub fn merge_reflects(lhs: &ShaderReflect, rhs: &ShaderReflect) -> Result<ShaderReflect> {
    let mut merged = lhs.clone();
    merged.stage |= rhs.stage;
    if merged.sets.len() < rhs.sets.len() {
        merged.sets.resize(rhs.sets.len(), Vec::new());
    }
    for (set_index, set) in rhs.sets.iter().enumerate() {
        for binding in set {
            let existing = merged.sets[set_index]
                .iter_mut()
                .find(|other| other.binding == binding.binding);
            match existing {
                Some(other) => {
                    ensure!(
                        other.descriptor_type == binding.descriptor_type,
                        "conflicting descriptor types for set {set_index} binding {}: {:?} vs {:?}",
                        binding.binding,
                        other.descriptor_type,
                        binding.descriptor_type
                    );
                    other.stages |= binding.stages;
                }
                None => merged.sets[set_index].push(*binding),
            }
        }
        merged.sets[set_index].sort_by_key(|binding| binding.binding);
    }
    for range in &rhs.push_ranges {
        let existing = merged
            .push_ranges
            .iter_mut()
            .find(|other| other.offset == range.offset && other.size == range.size);
        match existing {
            Some(other) => other.stage_flags |= range.stage_flags,
            None => {
                ensure!(
                    merged.push_ranges.len() < MAX_PUSH_RANGES,
                    "too many push-constant ranges after merge"
                );
                merged.push_ranges.push(*range);
            }
        }
    }
    Ok(merged)
}

pub struct Shader {
    pub module: vk::ShaderModule,
    pub reflect: ShaderReflect,
}

/// Shader modules keyed by path. Reloading compiles a new module and swaps
/// it in place; pipelines referencing the old module are recompiled by the
/// asset-reload hook.
pub struct ShaderCache {
    compiler: shaderc::Compiler,
    shaders: HashMap<String, Shader>,
}

impl ShaderCache {
    pub fn new() -> ShaderCache {
        ShaderCache {
            compiler: shaderc::Compiler::new().unwrap(),
            shaders: HashMap::new(),
        }
    }

    pub fn get(&mut self, dev: &Dev, path: &str) -> Result<&Shader> {
        if !self.shaders.contains_key(path) {
            let shader = self.load(dev, path)?;
            self.shaders.insert(path.to_string(), shader);
        }
        Ok(&self.shaders[path])
    }

    pub fn reload(&mut self, dev: &Dev, path: &str) -> Result<()> {
        let shader = self.load(dev, path)?;
        if let Some(old) = self.shaders.insert(path.to_string(), shader) {
            // Modules may be destroyed as soon as no new pipelines will be
            // created from them; existing pipelines keep working.
            unsafe { dev.destroy_shader_module(old.module, None) };
        }
        Ok(())
    }

    fn load(&self, dev: &Dev, path: &str) -> Result<Shader> {
        let source = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        let kind = shader_kind(path)?;
        let mut options = shaderc::CompileOptions::new().unwrap();
        let shader_dir = Path::new(path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        options.set_include_callback(move |name, _include_type, _source, _depth| {
            let include_path = shader_dir.join(name);
            let content = std::fs::read_to_string(&include_path)
                .map_err(|error| format!("failed to read include {name}: {error}"))?;
            Ok(shaderc::ResolvedInclude {
                resolved_name: include_path.display().to_string(),
                content,
            })
        });
        let artifact = self
            .compiler
            .compile_into_spirv(&source, kind, path, "main", Some(&options))
            .with_context(|| format!("failed to compile {path}"))?;
        if artifact.get_num_warnings() > 0 {
            warn!("{}", artifact.get_warning_messages().trim_end());
        }
        let code = artifact.as_binary();
        let reflect = reflect_spirv(code).with_context(|| format!("failed to reflect {path}"))?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { dev.create_shader_module(&module_info, None) }
            .map_err(|err| anyhow!("failed to create shader module for {path}: {err}"))?;
        debug!("shader compiled, \x1B[1mpath\x1B[0m: {path}");
        Ok(Shader { module, reflect })
    }

    pub fn destroy(&mut self, dev: &Dev) {
        for (_, shader) in self.shaders.drain() {
            unsafe { dev.destroy_shader_module(shader.module, None) };
        }
    }
}

fn shader_kind(path: &str) -> Result<shaderc::ShaderKind> {
    match Path::new(path).extension().and_then(|extension| extension.to_str()) {
        Some("vert") => Ok(shaderc::ShaderKind::Vertex),
        Some("frag") => Ok(shaderc::ShaderKind::Fragment),
        Some("comp") => Ok(shaderc::ShaderKind::Compute),
        _ => bail!("cannot infer shader kind of {path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hand-assembled module: a vertex shader with one uniform block
    // (set 0, binding 1) and a push-constant block holding a single vec4.
    fn tiny_vertex_module() -> Vec<u32> {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0000, 0, 20, 0];
        let op = |code: &mut Vec<u32>, opcode: u32, operands: &[u32]| {
            code.push(((operands.len() as u32 + 1) << 16) | opcode);
            code.extend_from_slice(operands);
        };
        // OpEntryPoint Vertex %1 "main"
        op(&mut words, OP_ENTRY_POINT, &[EXECUTION_MODEL_VERTEX, 1, 0x6e69616d, 0]);
        // Decorations: %7 Block, %8 DescriptorSet 0 Binding 1.
        op(&mut words, OP_DECORATE, &[7, DECORATION_BLOCK]);
        op(&mut words, OP_DECORATE, &[8, DECORATION_DESCRIPTOR_SET, 0]);
        op(&mut words, OP_DECORATE, &[8, DECORATION_BINDING, 1]);
        op(&mut words, OP_DECORATE, &[12, DECORATION_BLOCK]);
        // %2 float32, %3 vec4, %7 struct{vec4}, %6 ptr Uniform %7,
        // %8 variable Uniform.
        op(&mut words, OP_TYPE_FLOAT, &[2, 32]);
        op(&mut words, OP_TYPE_VECTOR, &[3, 2, 4]);
        op(&mut words, OP_TYPE_STRUCT, &[7, 3]);
        op(&mut words, OP_TYPE_POINTER, &[6, STORAGE_CLASS_UNIFORM, 7]);
        op(&mut words, OP_VARIABLE, &[6, 8, STORAGE_CLASS_UNIFORM]);
        // %12 struct{vec4}, %11 ptr PushConstant %12, %13 variable.
        op(&mut words, OP_TYPE_STRUCT, &[12, 3]);
        op(&mut words, OP_TYPE_POINTER, &[11, STORAGE_CLASS_PUSH_CONSTANT, 12]);
        op(&mut words, OP_VARIABLE, &[11, 13, STORAGE_CLASS_PUSH_CONSTANT]);
        words
    }

    #[test]
    fn reflects_uniform_and_push_constant() {
        let reflect = reflect_spirv(&tiny_vertex_module()).unwrap();
        assert_eq!(reflect.stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(reflect.sets.len(), 1);
        assert_eq!(
            reflect.sets[0],
            vec![BindingDesc {
                binding: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            }]
        );
        assert_eq!(reflect.push_ranges.len(), 1);
        assert_eq!(reflect.push_ranges[0].size, 16);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(reflect_spirv(&[0xdead_beef, 0, 0, 4, 0, 0]).is_err());
    }

    #[test]
    fn merge_unions_bindings_and_or_stages() {
        let vertex = ShaderReflect {
            stage: vk::ShaderStageFlags::VERTEX,
            sets: vec![vec![BindingDesc {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            }]],
            push_ranges: Vec::new(),
            local_size: [1, 1, 1],
        };
        let fragment = ShaderReflect {
            stage: vk::ShaderStageFlags::FRAGMENT,
            sets: vec![
                vec![BindingDesc {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    count: 1,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                }],
                vec![BindingDesc {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    count: 1,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                }],
            ],
            push_ranges: Vec::new(),
            local_size: [1, 1, 1],
        };
        let merged = merge_reflects(&vertex, &fragment).unwrap();
        assert_eq!(merged.sets.len(), 2);
        assert_eq!(
            merged.sets[0][0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            merged.sets[1][0].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn merge_rejects_conflicting_descriptor_types() {
        let make = |descriptor_type| ShaderReflect {
            stage: vk::ShaderStageFlags::VERTEX,
            sets: vec![vec![BindingDesc {
                binding: 0,
                descriptor_type,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            }]],
            push_ranges: Vec::new(),
            local_size: [1, 1, 1],
        };
        let lhs = make(vk::DescriptorType::UNIFORM_BUFFER);
        let rhs = make(vk::DescriptorType::STORAGE_BUFFER);
        assert!(merge_reflects(&lhs, &rhs).is_err());
    }

    #[test]
    fn push_constant_sizing_follows_std140() {
        // struct { mat4; vec3; uint; vec3; uint; uint; uint; uint } is the
        // cull shader's push block, 108 bytes.
        let mut ids = vec![SpirvId::default(); 10];
        ids[1] = SpirvId {
            opcode: OP_TYPE_FLOAT,
            width: 32,
            ..SpirvId::default()
        };
        ids[2] = SpirvId {
            opcode: OP_TYPE_INT,
            width: 32,
            ..SpirvId::default()
        };
        ids[3] = SpirvId {
            opcode: OP_TYPE_VECTOR,
            component_type: 1,
            component_count: 4,
            ..SpirvId::default()
        };
        ids[4] = SpirvId {
            opcode: OP_TYPE_MATRIX,
            component_type: 3,
            component_count: 4,
            ..SpirvId::default()
        };
        ids[5] = SpirvId {
            opcode: OP_TYPE_VECTOR,
            component_type: 1,
            component_count: 3,
            ..SpirvId::default()
        };
        ids[6] = SpirvId {
            opcode: OP_TYPE_STRUCT,
            member_types: vec![4, 5, 2, 5, 2, 2, 2, 2],
            ..SpirvId::default()
        };
        assert_eq!(type_size(&ids, 6, 0).unwrap(), 108);
    }
}
