//! Built-in stage types.

mod echo;
mod session;

pub use echo::EchoStage;
pub use session::SessionStage;

use crate::pipeline::StageFactory;

/// Factory with every built-in stage type registered under its type name.
pub fn default_factory() -> StageFactory {
    let mut factory = StageFactory::new();
    factory
        .register("SessionStage", SessionStage::make)
        .register("EchoStage", EchoStage::make);
    factory
}
