//! # trellis-recipes: ready-made training setups
//!
//! Pre-wired loops built from `trellis-core` pieces: an image classifier with
//! periodic evaluation, and a GAN recipe composing discriminator, generator
//! and test loops. The `debug` module has a small trainable model for tests
//! and demos.

pub mod classifier;
pub mod debug;
pub mod gan;

pub use classifier::{ClassifierCallbacks, ClassifierOutcome, ImageClassifier};
pub use debug::{Sgd, SoftmaxProbe};
pub use gan::{GanContext, GanRecipe, GanStep, GanSteps, gan_recipe};
