/// 服务描述生成与渲染

pub mod generator;
pub mod render;

pub use generator::{DescriptorGenerator, GeneratedDescriptor, ReservedKeys};
pub use render::{render_compose, render_env_file};
