//! Declarative AWS infrastructure model that synthesizes CloudFormation.
//!
//! Constructs are declared into a [`Stack`]; an [`App`] synthesizes its
//! stacks together, resolving `Fn::ImportValue` names against the exports
//! of the other stacks and auditing database reachability.
//!
//! ```ignore
//! let mut stack = Stack::new("Base", DeployTarget::default());
//! let vpc = stack.add(Vpc::new("MyVPC").max_azs(2))?;
//! stack.export("VpcId", vpc.vpc_id.clone(), "BaseVpcId")?;
//!
//! let mut app = App::new();
//! app.add_stack(stack)?;
//! app.synth()?.write_to(Path::new("cdk.out"), &[])?;
//! ```

pub mod app;
pub mod audit;
pub mod cidr;
pub mod compute;
pub mod database;
pub mod error;
pub mod glue;
pub mod iam;
pub mod load_balancer;
pub mod network;
pub mod security_group;
pub mod stack;
pub mod storage;
pub mod template;
pub mod user_data;

pub use app::{App, CloudAssembly, SynthesizedStack};
pub use cidr::{CidrPlanner, Ipv4Cidr, Ipv6Cidr};
pub use error::{SynthError, SynthResult};
pub use stack::{Construct, Stack};
pub use template::{Expr, RemovalPolicy, Template};
