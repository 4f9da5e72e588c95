//! Concrete stacks of the data-engineering training environment.
//!
//! [`build_app`] assembles them in dependency order: the base stack, the
//! Glue ETL stack importing its exports, and the optional sandbox database.

pub mod base;
pub mod config;
pub mod error;
pub mod etl;
pub mod exports;
pub mod sandbox;

pub use base::BaseStack;
pub use config::{BaseStackConfig, ComputeMode, EtlStackConfig, InfraConfig, SandboxConfig};
pub use error::{StackConfigError, StacksResult};
pub use etl::EtlStack;
pub use exports::ExportNames;
pub use sandbox::SandboxDatabaseStack;

use infra_construct::App;
use tracing::info;

/// Declare every enabled stack into an [`App`]
pub fn build_app(config: &InfraConfig) -> StacksResult<App> {
    let mut app = App::new();

    let (base, _) = BaseStack::build(&config.base, &config.exports, &config.target)?;
    app.add_stack(base)?;

    if config.etl.enabled {
        // the Glue connection sits in an isolated subnet without a NAT route
        if !config.base.s3_gateway_endpoint {
            return Err(StackConfigError::MissingS3Endpoint {
                base: config.base.stack_name.clone(),
                etl: config.etl.stack_name.clone(),
            });
        }
        let (etl, _) = EtlStack::build(&config.etl, &config.exports, &config.target)?;
        app.add_stack(etl)?;
    }

    if let Some((sandbox, _)) = SandboxDatabaseStack::build(&config.sandbox, &config.target)? {
        app.add_stack(sandbox)?;
    }

    info!(deploy_target = %config.target.uri(), stacks = ?app.stack_names(), "Assembled app");
    Ok(app)
}
