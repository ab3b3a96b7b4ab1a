use crate::dataset::{Corpus, LabeledExample};
use crate::error::{Error, Result};
use crossbeam::channel::bounded;
use nn::feature_set::NUM_FEATURES;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::thread;

/// A subset of a corpus, examples kept in corpus order
#[derive(Debug, Clone)]
pub struct Subset<'a> {
    corpus: &'a Corpus,
    indices: Vec<usize>,
}

/// Splits the corpus into disjoint (train, validation) subsets covering every example.
/// The validation subset gets `floor(len * validation_fraction)` examples chosen by a
/// seeded permutation
pub fn split(
    corpus: &Corpus,
    validation_fraction: f64,
    seed: u64,
) -> Result<(Subset<'_>, Subset<'_>)> {
    if !(0.0..1.0).contains(&validation_fraction) {
        return Err(Error::Configuration(format!(
            "validation fraction must be in [0, 1), got {}",
            validation_fraction
        )));
    }

    let mut permutation: Vec<usize> = (0..corpus.len()).collect();
    permutation.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

    let validation_len = (corpus.len() as f64 * validation_fraction).floor() as usize;
    let mut validation = permutation[..validation_len].to_vec();
    let mut train = permutation[validation_len..].to_vec();
    validation.sort_unstable();
    train.sort_unstable();

    Ok((
        Subset { corpus, indices: train },
        Subset {
            corpus,
            indices: validation,
        },
    ))
}

/// Order in which a pass visits a subset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    /// Corpus order
    Sequential,
    /// Seeded permutation. Each `pass` of the same seed gets its own independent order
    Shuffled { seed: u64, pass: u64 },
}

/// Dense inputs and targets of up to `batch_size` examples
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `len × 768` features, row major
    pub features: Vec<f32>,
    pub labels: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Input row of the i-th example
    pub fn row(&self, i: usize) -> &[f32] {
        &self.features[i * NUM_FEATURES..(i + 1) * NUM_FEATURES]
    }
}

impl<'a> Subset<'a> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn examples(&self) -> impl Iterator<Item = &'a LabeledExample> + '_ {
        self.indices.iter().map(|&i| &self.corpus.examples[i])
    }

    /// A lazy pass over the subset. The final batch may be partial
    pub fn batches(&self, batch_size: usize, order: BatchOrder) -> Result<Batches<'a>> {
        if batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".to_string()));
        }

        let mut indices = self.indices.clone();
        if let BatchOrder::Shuffled { seed, pass } = order {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(pass);
            indices.shuffle(&mut rng);
        }

        Ok(Batches {
            corpus: self.corpus,
            indices,
            batch_size,
            next: 0,
        })
    }
}

/// Iterator over the batches of one pass
#[derive(Debug)]
pub struct Batches<'a> {
    corpus: &'a Corpus,
    indices: Vec<usize>,
    batch_size: usize,
    next: usize,
}

impl<'a> Batches<'a> {
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl<'a> Iterator for Batches<'a> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next >= self.indices.len() {
            return None;
        }

        let end = (self.next + self.batch_size).min(self.indices.len());
        let rows = &self.indices[self.next..end];
        self.next = end;

        let mut batch = Batch {
            features: vec![0.0; rows.len() * NUM_FEATURES],
            labels: Vec::with_capacity(rows.len()),
        };
        for (chunk, &i) in batch.features.chunks_mut(NUM_FEATURES).zip(rows) {
            let example = &self.corpus.examples[i];
            example.features.write_dense(chunk);
            batch.labels.push(example.label);
        }

        Some(batch)
    }
}

/// Assembles batches on a producer thread while `consume` processes them, in order.
/// At most `capacity` batches wait in memory. Stops at the first error of `consume`
pub fn prefetch<F>(batches: Batches<'_>, capacity: usize, mut consume: F) -> Result<()>
where
    F: FnMut(Batch) -> Result<()>,
{
    let (sender, receiver) = bounded(capacity.max(1));

    thread::scope(|s| {
        // the receiver is dropped when this closure returns, which unblocks the producer
        let receiver = receiver;

        s.spawn(move || {
            for batch in batches {
                if sender.send(batch).is_err() {
                    break;
                }
            }
        });

        for batch in receiver.iter() {
            consume(batch)?;
        }
        Ok(())
    })
}
