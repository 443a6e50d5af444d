//! Trains a softmax probe on two synthetic point clouds through the full
//! classifier recipe: layered config, logging, evaluation and checkpoints.

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::info;
use trellis_core::{
    RecipeConfig, Tensor, Value, VecSource, config_exists, init_logging, load_config, save_workspace_config,
};
use trellis_recipes::{ClassifierCallbacks, ImageClassifier, SoftmaxProbe};

const FEATURES: usize = 2;
const CLASSES: usize = 2;
const BATCH: usize = 16;
const TRAIN_BATCHES: usize = 8;

/// `n` batches of points around `(±1.5, ±1.5)`, labelled by cloud.
fn blobs(rng: &mut StdRng, n: usize) -> anyhow::Result<Vec<Value>> {
    let mut batches = Vec::with_capacity(n);
    for _ in 0..n {
        let mut x = Vec::with_capacity(BATCH * FEATURES);
        let mut y = Vec::with_capacity(BATCH);
        for _ in 0..BATCH {
            let label = rng.gen_range(0..CLASSES);
            let center = if label == 0 { -1.5 } else { 1.5 };
            for _ in 0..FEATURES {
                x.push(center + rng.gen_range(-1.0f32..1.0));
            }
            y.push(label as f32);
        }
        batches.push(Value::Tuple(vec![
            Value::Tensor(Tensor::new(x, vec![BATCH, FEATURES])?),
            Value::Tensor(Tensor::from_slice(&y)),
        ]));
    }
    Ok(batches)
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if !config_exists(Some(&workspace)) {
        let path = save_workspace_config(&workspace, &RecipeConfig::default())?;
        println!("Wrote default configuration to {}", path.display());
    }
    let config = load_config(Some(&workspace), None).context("loading configuration")?;
    // Evaluate at least once per pass over this small training set.
    let config = RecipeConfig {
        test_every: config.test_every.min(TRAIN_BATCHES as u64),
        ..config
    };
    let _guard = init_logging(&config.logging)?;

    let mut rng = StdRng::seed_from_u64(0);
    let train = VecSource::new(blobs(&mut rng, TRAIN_BATCHES)?);
    let test = VecSource::new(blobs(&mut rng, 2)?);
    let model = SoftmaxProbe::initialized(FEATURES, CLASSES, &mut rng)?.with_lr(0.2);

    info!(epochs = config.epochs, device = %config.device, "Training softmax probe");
    let mut classifier = ImageClassifier::new(model, train, test, &config, ClassifierCallbacks::default());
    let outcome = classifier.run(config.epochs)?;

    for (name, value) in &outcome.test_metrics {
        if let Some(x) = value.as_scalar() {
            println!("test {name}: {x:.4}");
        }
    }
    Ok(())
}
