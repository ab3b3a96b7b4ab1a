pub mod checkpoint;
pub mod scheduler;

use crate::dataset::{Corpus, Provenance};
use crate::error::{Error, Result};
use crate::split::{prefetch, split, BatchOrder, Subset};
use checkpoint::{best_path, epoch_path, Checkpoint};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use nn::model::{Architecture, Network};
use nn::optimizer::{Adam, Optimizer};
use scheduler::PlateauScheduler;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub architecture: Architecture,
    /// Total number of epochs, a resumed run stops at the same epoch
    pub epochs: u32,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub validation_fraction: f64,
    /// Seeds the split, the network initialization and the shuffles
    pub seed: u64,
    pub lr_factor: f32,
    pub lr_patience: u32,
    pub checkpoint_dir: PathBuf,
    /// Batches assembled ahead of the optimizer
    pub prefetch: usize,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.architecture
            .validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        if self.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Configuration(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(Error::Configuration(format!(
                "learning rate factor must be in (0, 1), got {}",
                self.lr_factor
            )));
        }
        Ok(())
    }
}

/// Training configuration and dataset of a run, stored in every checkpoint so
/// an export from any of them can describe how the model was produced
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub batch_size: usize,
    /// Learning rate the run started with
    pub learning_rate: f32,
    pub validation_fraction: f64,
    pub seed: u64,
    pub dataset_size: usize,
    pub provenance: Provenance,
}

impl RunInfo {
    pub fn new(config: &TrainConfig, corpus: &Corpus) -> Self {
        RunInfo {
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            validation_fraction: config.validation_fraction,
            seed: config.seed,
            dataset_size: corpus.len(),
            provenance: corpus.provenance.clone(),
        }
    }
}

/// Summary of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: u32,
    pub train_loss: f32,
    pub validation_loss: f32,
    /// Learning rate in use at the end of the epoch
    pub learning_rate: f32,
    /// Whether `best.ckpt` was replaced
    pub new_best: bool,
}

/// Runs epochs of training and validation over a split corpus, checkpointing after each one
pub struct Trainer<'a> {
    config: TrainConfig,
    train: Subset<'a>,
    validation: Subset<'a>,

    network: Network,
    optimizer: Adam,
    scheduler: PlateauScheduler,
    run: RunInfo,

    /// First epoch to run
    start_epoch: u32,
    best_validation_loss: f32,
    last_train_loss: Option<f32>,
}

impl<'a> Trainer<'a> {
    /// A fresh run with a seeded network
    pub fn new(config: TrainConfig, corpus: &'a Corpus) -> Result<Self> {
        config.validate()?;
        let network = Network::new(config.architecture.clone(), config.seed)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let optimizer = Adam::new(&network, config.learning_rate);
        let scheduler = PlateauScheduler::new(config.lr_factor, config.lr_patience);

        Self::assemble(config, corpus, network, optimizer, scheduler, 0, f32::INFINITY, None)
    }

    /// Continues a run from a checkpoint, at the epoch after it
    pub fn resume(config: TrainConfig, corpus: &'a Corpus, checkpoint: Checkpoint) -> Result<Self> {
        config.validate()?;
        if checkpoint.network.architecture() != &config.architecture {
            warn!(
                "checkpoint architecture ({}) differs from the configured one ({}), \
                 using the checkpoint's",
                checkpoint.network.architecture(),
                config.architecture
            );
        }

        if checkpoint.run.provenance != corpus.provenance {
            warn!(
                "checkpoint was trained on {} ({} positions), resuming on {} ({} positions)",
                checkpoint.run.provenance.source,
                checkpoint.run.dataset_size,
                corpus.provenance.source,
                corpus.len()
            );
        }

        info!("resuming from epoch {}", checkpoint.epoch);

        Self::assemble(
            config,
            corpus,
            checkpoint.network,
            checkpoint.optimizer,
            checkpoint.scheduler,
            checkpoint.epoch + 1,
            checkpoint.best_validation_loss,
            Some(checkpoint.train_loss),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: TrainConfig,
        corpus: &'a Corpus,
        network: Network,
        optimizer: Adam,
        scheduler: PlateauScheduler,
        start_epoch: u32,
        best_validation_loss: f32,
        last_train_loss: Option<f32>,
    ) -> Result<Self> {
        let (train, validation) = split(corpus, config.validation_fraction, config.seed)?;
        if train.is_empty() || validation.is_empty() {
            return Err(Error::Configuration(format!(
                "{} examples give {} for training and {} for validation, both need at least one",
                corpus.len(),
                train.len(),
                validation.len()
            )));
        }

        info!(
            "{} network, {} parameters, {} train / {} validation positions",
            network.architecture(),
            network.num_parameters(),
            train.len(),
            validation.len()
        );

        Ok(Self {
            run: RunInfo::new(&config, corpus),
            config,
            train,
            validation,
            network,
            optimizer,
            scheduler,
            start_epoch,
            best_validation_loss,
            last_train_loss,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn run_info(&self) -> &RunInfo {
        &self.run
    }

    pub fn start_epoch(&self) -> u32 {
        self.start_epoch
    }

    pub fn best_validation_loss(&self) -> f32 {
        self.best_validation_loss
    }

    /// Train loss of the last completed epoch
    pub fn last_train_loss(&self) -> Option<f32> {
        self.last_train_loss
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lr()
    }

    /// One pass over the training subset with an optimizer step per batch.
    /// Returns the mean squared error over the examples, measured before each update
    pub fn train_epoch(&mut self, epoch: u32) -> Result<f32> {
        let order = BatchOrder::Shuffled {
            seed: self.config.seed,
            pass: epoch as u64 + 1,
        };
        let batches = self.train.batches(self.config.batch_size, order)?;

        let bar = ProgressBar::new(batches.num_batches() as u64).with_style(
            ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos}/{len} batches [{elapsed_precise}<{eta}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let network = &mut self.network;
        let optimizer = &mut self.optimizer;
        let mut total_loss = 0.0f64;

        prefetch(batches, self.config.prefetch, |batch| {
            let scale = 1.0 / batch.len() as f32;
            let mut batch_loss = 0.0f64;

            network.zero_grad();
            for i in 0..batch.len() {
                batch_loss +=
                    network.accumulate_gradients(batch.row(i), batch.labels[i], scale) as f64;
            }
            optimizer.step(network);

            total_loss += batch_loss;
            bar.inc(1);
            bar.set_message(format!("loss {:.6}", batch_loss / batch.len() as f64));
            Ok(())
        })?;
        bar.finish_and_clear();

        Ok((total_loss / self.train.len() as f64) as f32)
    }

    /// Mean squared error over the validation subset, no update
    pub fn validate_epoch(&self) -> Result<f32> {
        let batches = self.validation.batches(self.config.batch_size, BatchOrder::Sequential)?;
        let network = &self.network;
        let mut total_loss = 0.0f64;

        prefetch(batches, self.config.prefetch, |batch| {
            for i in 0..batch.len() {
                let error = network.value(batch.row(i)) - batch.labels[i];
                total_loss += (error * error) as f64;
            }
            Ok(())
        })?;

        Ok((total_loss / self.validation.len() as f64) as f32)
    }

    /// Runs the remaining epochs. Every epoch is checkpointed before the next one starts
    pub fn run(&mut self) -> Result<Vec<EpochReport>> {
        let dir = &self.config.checkpoint_dir;
        fs::create_dir_all(dir).map_err(|source| Error::CheckpointIo {
            path: dir.clone(),
            source,
        })?;

        let mut reports = vec![];

        for epoch in self.start_epoch..self.config.epochs {
            let train_loss = self.train_epoch(epoch)?;
            let validation_loss = self.validate_epoch()?;

            if self.scheduler.step(validation_loss, &mut self.optimizer) {
                info!("validation loss plateaued, learning rate now {:e}", self.optimizer.lr());
            }

            let new_best = validation_loss < self.best_validation_loss;
            if new_best {
                self.best_validation_loss = validation_loss;
            }

            let checkpoint = Checkpoint {
                epoch,
                train_loss,
                validation_loss,
                best_validation_loss: self.best_validation_loss,
                network: self.network.clone(),
                optimizer: self.optimizer.clone(),
                scheduler: self.scheduler.clone(),
                run: self.run.clone(),
            };
            checkpoint.save(&epoch_path(&self.config.checkpoint_dir, epoch))?;
            if new_best {
                checkpoint.save(&best_path(&self.config.checkpoint_dir))?;
            }

            info!(
                "epoch {}/{}: train loss {:.6}, validation loss {:.6}{}",
                epoch + 1,
                self.config.epochs,
                train_loss,
                validation_loss,
                if new_best { " (new best)" } else { "" }
            );

            self.last_train_loss = Some(train_loss);
            self.start_epoch = epoch + 1;
            reports.push(EpochReport {
                epoch,
                train_loss,
                validation_loss,
                learning_rate: self.optimizer.lr(),
                new_best,
            });
        }

        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{LabelPolicy, LabeledExample, Provenance};
    use nn::feature_set::basic::Basic;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use shakmaty::{Chess, Position};

    /// Positions from random playouts labeled with the material balance
    fn corpus(n: usize) -> Corpus {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut examples = vec![];
        let mut pos = Chess::default();

        while examples.len() < n {
            let moves = pos.legal_moves();
            match moves.choose(&mut rng) {
                Some(m) if pos.fullmoves().get() < 60 => pos.play_unchecked(m),
                _ => {
                    pos = Chess::default();
                    continue;
                }
            }

            let friendly = pos.board().by_color(pos.turn()).count() as f32;
            let enemy = pos.board().by_color(pos.turn().other()).count() as f32;
            examples.push(LabeledExample {
                features: Basic::encode(&pos),
                label: ((friendly - enemy) / 4.0).tanh(),
            });
        }

        Corpus {
            examples,
            provenance: Provenance {
                source: "playouts".to_string(),
                created: String::new(),
                label_policy: LabelPolicy::Engine,
                engine_depth: None,
                max_games: 0,
                positions_per_game: 0,
                seed: 11,
                games_read: 0,
                games_skipped: 0,
            },
        }
    }

    fn config(dir: &std::path::Path, epochs: u32) -> TrainConfig {
        TrainConfig {
            architecture: Architecture::Plain { hidden_layers: vec![16] },
            epochs,
            batch_size: 16,
            learning_rate: 1e-3,
            validation_fraction: 0.2,
            seed: 5,
            lr_factor: 0.5,
            lr_patience: 3,
            checkpoint_dir: dir.to_path_buf(),
            prefetch: 2,
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus(300);
        let mut trainer = Trainer::new(config(dir.path(), 6), &corpus).unwrap();

        let initial = trainer.validate_epoch().unwrap();
        let reports = trainer.run().unwrap();

        assert_eq!(reports.len(), 6);
        assert!(reports.last().unwrap().train_loss < reports[0].train_loss);
        assert!(trainer.best_validation_loss() < initial);
        assert!(reports[0].new_best);

        for epoch in 0..6 {
            assert!(epoch_path(dir.path(), epoch).exists());
        }
        let best = Checkpoint::load(&best_path(dir.path())).unwrap();
        assert_eq!(best.validation_loss, trainer.best_validation_loss());
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus(20);

        let mut bad = config(dir.path(), 1);
        bad.batch_size = 0;
        assert!(matches!(Trainer::new(bad, &corpus), Err(Error::Configuration(_))));

        let mut bad = config(dir.path(), 1);
        bad.learning_rate = -1.0;
        assert!(matches!(Trainer::new(bad, &corpus), Err(Error::Configuration(_))));

        // 3 examples: floor(3 * 0.2) = 0 validation examples
        let tiny = Corpus {
            examples: corpus.examples[..3].to_vec(),
            provenance: corpus.provenance.clone(),
        };
        assert!(matches!(Trainer::new(config(dir.path(), 1), &tiny), Err(Error::Configuration(_))));
    }
}
