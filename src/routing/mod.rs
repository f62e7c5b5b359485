pub mod matcher;
pub mod replacer;
pub mod template;

pub use matcher::{route_key, CompiledRoute, DownstreamRoute, RouteTable};
pub use replacer::replace_template_variables;
pub use template::{TemplateBinding, UrlMatch, UrlTemplate};
