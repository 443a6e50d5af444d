//! # trellis-core: callback-driven training loops
//!
//! The orchestration layer of Trellis: a shared [`State`] store, an ordered
//! [`CallbackRunner`], the [`Recipe`] loop that ties a data source, a step
//! function and callbacks together, and the built-in callbacks used to
//! compose sub-loops, average metrics, log and checkpoint.
//!
//! Tensors, modules and optimizers are thin capability traits over host
//! buffers; numeric kernels live with whatever implements them.

// Foundation
pub mod config;
pub mod error;
pub mod logging;

// State and dispatch
pub mod callback;
pub mod path;
pub mod state;
pub mod value;

// Loop
pub mod callbacks;
pub mod data;
pub mod recipe;

// Models and tensors
pub mod activations;
pub mod device;
pub mod init;
pub mod math;
pub mod model;
pub mod module;
pub mod tensor;

// Persistence
pub mod checkpoint;

// Re-exports
pub use activations::WithSavedActivations;
pub use callback::{Callback, CallbackRunner, Hook};
pub use checkpoint::{CheckpointManager, CheckpointRecord, Checkpointable, OptimizerHandle};
pub use config::{CheckpointConfig, LoggingConfig, RecipeConfig, config_exists, load_config, save_workspace_config};
pub use data::{DataSource, FnSource, Forever, Steps, VecSource, forever};
pub use device::{Device, send_to_device};
pub use error::{PathError, RecipeError, Result};
pub use logging::init_logging;
pub use model::{Model, Optimizer};
pub use module::{DetachedModule, FrozenModule, Module, Parameter};
pub use path::dict_by_key;
pub use recipe::{LoopPhase, Recipe, Step};
pub use state::State;
pub use tensor::Tensor;
pub use value::Value;
