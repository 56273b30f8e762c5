pub mod logging;
pub mod path_resolver;
pub mod validation;
pub mod version;
