use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nn::optimizer::Optimizer;
use std::io::{self, Read, Write};

/// Reduces the learning rate when the validation loss stops improving.
///
/// An epoch improves when its loss is below `best * (1 - threshold)`.
/// Once more than `patience` epochs in a row fail to improve, the learning
/// rate is multiplied by `factor` and the count starts over.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauScheduler {
    pub factor: f32,
    pub patience: u32,
    pub threshold: f32,

    best: f32,
    bad_epochs: u32,
}

impl PlateauScheduler {
    pub fn new(factor: f32, patience: u32) -> Self {
        Self {
            factor,
            patience,
            threshold: 1e-4,
            best: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn bad_epochs(&self) -> u32 {
        self.bad_epochs
    }

    /// Records the loss of an epoch, returns true if the learning rate was reduced
    pub fn step(&mut self, loss: f32, optimizer: &mut dyn Optimizer) -> bool {
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            optimizer.set_lr(optimizer.lr() * self.factor);
            self.bad_epochs = 0;
            return true;
        }

        false
    }

    pub fn write_to(&self, write: &mut dyn Write) -> io::Result<()> {
        write.write_f32::<LittleEndian>(self.factor)?;
        write.write_u32::<LittleEndian>(self.patience)?;
        write.write_f32::<LittleEndian>(self.threshold)?;
        write.write_f32::<LittleEndian>(self.best)?;
        write.write_u32::<LittleEndian>(self.bad_epochs)?;
        Ok(())
    }

    pub fn read_from(read: &mut dyn Read) -> io::Result<Self> {
        Ok(Self {
            factor: read.read_f32::<LittleEndian>()?,
            patience: read.read_u32::<LittleEndian>()?,
            threshold: read.read_f32::<LittleEndian>()?,
            best: read.read_f32::<LittleEndian>()?,
            bad_epochs: read.read_u32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nn::model::{Architecture, Network};
    use nn::optimizer::Adam;

    #[test]
    fn test_reduces_after_patience() {
        let net = Network::new(Architecture::Plain { hidden_layers: vec![2] }, 0).unwrap();
        let mut adam = Adam::new(&net, 1e-3);
        let mut scheduler = PlateauScheduler::new(0.5, 3);

        assert!(!scheduler.step(1.0, &mut adam));
        assert!(!scheduler.step(0.5, &mut adam));

        // three bad epochs are tolerated, the fourth reduces
        for _ in 0..3 {
            assert!(!scheduler.step(0.6, &mut adam));
        }
        assert_eq!(adam.lr(), 1e-3);
        assert!(scheduler.step(0.6, &mut adam));
        assert_eq!(adam.lr(), 0.5e-3);
        assert_eq!(scheduler.bad_epochs(), 0);

        // an improvement resets the count
        for _ in 0..3 {
            assert!(!scheduler.step(0.6, &mut adam));
        }
        assert!(!scheduler.step(0.1, &mut adam));
        assert_eq!(scheduler.bad_epochs(), 0);
        assert_eq!(adam.lr(), 0.5e-3);
    }

    #[test]
    fn test_state_roundtrip() {
        let net = Network::new(Architecture::Plain { hidden_layers: vec![2] }, 0).unwrap();
        let mut adam = Adam::new(&net, 1e-3);
        let mut scheduler = PlateauScheduler::new(0.5, 2);
        scheduler.step(0.3, &mut adam);
        scheduler.step(0.4, &mut adam);

        let mut bytes = vec![];
        scheduler.write_to(&mut bytes).unwrap();
        assert_eq!(PlateauScheduler::read_from(&mut bytes.as_slice()).unwrap(), scheduler);
    }
}
