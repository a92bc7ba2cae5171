//! Arbalest - template-driven network probing engine
//!
//! Declarative YAML templates describe sequences of HTTP and raw TCP/TLS
//! requests together with match and extract rules; the engine compiles
//! each template and executes it against a target, emitting structured
//! result events for matched requests.
//!
//! ```no_run
//! use arbalest::template::Template;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut template = Template::from_yaml(include_str!("../demos/apache-detect.yaml"))?;
//! template.compile()?;
//! let results = template.execute("http://target.local", None).await?;
//! for result in results {
//!     println!("{}", result.summary());
//! }
//! # Ok(())
//! # }
//! ```

pub mod dsl;
pub mod error;
pub mod http;
pub mod network;
pub mod operators;
pub mod scan;
pub mod template;

pub use error::{CompileError, EvalError, TemplateError};
pub use scan::{InternalEvent, ResultEvent, ScanContext};
pub use template::{load_templates_from_dir, Severity, Template};
