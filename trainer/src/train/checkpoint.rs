//! Checkpoint file.
//!
//! Layout (little endian): magic `EVCK`, format version (u32), epoch (u32),
//! train loss, validation loss and best validation loss (f32), architecture and
//! run info as length-prefixed JSON, network parameters, optimizer state,
//! scheduler state.

use super::scheduler::PlateauScheduler;
use super::RunInfo;
use crate::atomic::write_atomically;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nn::model::{Architecture, Network};
use nn::optimizer::Adam;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"EVCK";
const CHECKPOINT_VERSION: u32 = 2;

/// Upper bound of the JSON sections
const MAX_SECTION_LEN: u64 = 1 << 20;

/// Everything needed to continue a run exactly where it stopped
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: u32,
    pub train_loss: f32,
    pub validation_loss: f32,
    /// Best validation loss up to and including this epoch
    pub best_validation_loss: f32,
    pub network: Network,
    pub optimizer: Adam,
    pub scheduler: PlateauScheduler,
    pub run: RunInfo,
}

/// `epoch_NNN.ckpt`
pub fn epoch_path(dir: &Path, epoch: u32) -> PathBuf {
    dir.join(format!("epoch_{:03}.ckpt", epoch))
}

pub fn best_path(dir: &Path) -> PathBuf {
    dir.join("best.ckpt")
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn write_section(write: &mut dyn Write, section: &[u8]) -> io::Result<()> {
    write.write_u32::<LittleEndian>(section.len() as u32)?;
    write.write_all(section)
}

fn read_section(read: &mut dyn Read) -> io::Result<Vec<u8>> {
    let len = read.read_u32::<LittleEndian>()? as u64;
    if len > MAX_SECTION_LEN {
        return Err(invalid_data(format!("section of {} bytes is too large", len)));
    }

    let mut section = vec![];
    Read::take(&mut *read, len).read_to_end(&mut section)?;
    if section.len() as u64 != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(section)
}

impl Checkpoint {
    fn write_to(&self, write: &mut dyn Write) -> io::Result<()> {
        let architecture =
            serde_json::to_vec(self.network.architecture()).map_err(io::Error::from)?;
        let run = serde_json::to_vec(&self.run).map_err(io::Error::from)?;

        write.write_all(MAGIC)?;
        write.write_u32::<LittleEndian>(CHECKPOINT_VERSION)?;
        write.write_u32::<LittleEndian>(self.epoch)?;
        write.write_f32::<LittleEndian>(self.train_loss)?;
        write.write_f32::<LittleEndian>(self.validation_loss)?;
        write.write_f32::<LittleEndian>(self.best_validation_loss)?;
        write_section(write, &architecture)?;
        write_section(write, &run)?;

        self.network.write_params(write)?;
        self.optimizer.write_state(write)?;
        self.scheduler.write_to(write)?;
        Ok(())
    }

    fn read_from(read: &mut dyn Read) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        read.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid_data("not a checkpoint file"));
        }

        let version = read.read_u32::<LittleEndian>()?;
        if version != CHECKPOINT_VERSION {
            return Err(invalid_data(format!("unsupported checkpoint version {}", version)));
        }

        let epoch = read.read_u32::<LittleEndian>()?;
        let train_loss = read.read_f32::<LittleEndian>()?;
        let validation_loss = read.read_f32::<LittleEndian>()?;
        let best_validation_loss = read.read_f32::<LittleEndian>()?;

        let architecture: Architecture =
            serde_json::from_slice(&read_section(read)?).map_err(io::Error::from)?;
        let run: RunInfo = serde_json::from_slice(&read_section(read)?).map_err(io::Error::from)?;

        // parameters are overwritten right after
        let mut network = Network::new(architecture, 0).map_err(|e| invalid_data(e.to_string()))?;
        network.read_params(read)?;

        let optimizer = Adam::read_state(&network, read)?;
        let scheduler = PlateauScheduler::read_from(read)?;

        Ok(Checkpoint {
            epoch,
            train_loss,
            validation_loss,
            best_validation_loss,
            network,
            optimizer,
            scheduler,
            run,
        })
    }

    /// Writes the checkpoint atomically, the previous file (if any) stays intact on failure
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomically(path, |writer| self.write_to(writer)).map_err(|source| {
            Error::CheckpointIo {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        File::open(path)
            .and_then(|file| Self::read_from(&mut BufReader::new(file)))
            .map_err(|source| Error::CheckpointIo {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{LabelPolicy, Provenance};

    fn run_info() -> RunInfo {
        RunInfo {
            batch_size: 64,
            learning_rate: 1e-3,
            validation_fraction: 0.1,
            seed: 42,
            dataset_size: 1200,
            provenance: Provenance {
                source: "games.pgn.zst".to_string(),
                created: "2026-01-01T00:00:00+00:00".to_string(),
                label_policy: LabelPolicy::Engine,
                engine_depth: Some(8),
                max_games: 200,
                positions_per_game: 6,
                seed: 7,
                games_read: 200,
                games_skipped: 3,
            },
        }
    }

    fn checkpoint(architecture: Architecture) -> Checkpoint {
        let network = Network::new(architecture, 3).unwrap();
        let optimizer = Adam::new(&network, 1e-3);

        Checkpoint {
            epoch: 7,
            train_loss: 0.25,
            validation_loss: 0.3,
            best_validation_loss: 0.28,
            network,
            optimizer,
            scheduler: PlateauScheduler::new(0.5, 3),
            run: run_info(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        for architecture in [
            Architecture::Plain { hidden_layers: vec![8, 4] },
            Architecture::PolicyValue { filters: 2, blocks: 1 },
        ] {
            let ckpt = checkpoint(architecture);
            let path = epoch_path(dir.path(), ckpt.epoch);
            ckpt.save(&path).unwrap();

            assert_eq!(Checkpoint::load(&path).unwrap(), ckpt);
        }
        assert!(dir.path().join("epoch_007.ckpt").exists());
    }

    #[test]
    fn test_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.ckpt");
        assert!(matches!(
            Checkpoint::load(&missing),
            Err(Error::CheckpointIo { path, .. }) if path == missing
        ));

        let garbage = dir.path().join("garbage.ckpt");
        std::fs::write(&garbage, b"EVCK\x09\x00\x00\x00").unwrap();
        assert!(matches!(Checkpoint::load(&garbage), Err(Error::CheckpointIo { .. })));

        // a length prefix far beyond the file is rejected before allocating it
        let oversized = dir.path().join("oversized.ckpt");
        let mut bytes = b"EVCK".to_vec();
        bytes.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&oversized, &bytes).unwrap();
        assert!(matches!(
            Checkpoint::load(&oversized),
            Err(Error::CheckpointIo { source, .. }) if source.kind() == io::ErrorKind::InvalidData
        ));

        // a section cut short by the end of the file
        let truncated = dir.path().join("truncated.ckpt");
        bytes.truncate(bytes.len() - 4);
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"{\"type\"");
        std::fs::write(&truncated, &bytes).unwrap();
        assert!(matches!(
            Checkpoint::load(&truncated),
            Err(Error::CheckpointIo { source, .. }) if source.kind() == io::ErrorKind::UnexpectedEof
        ));

        let unwritable = dir.path().join("no-such-dir").join("best.ckpt");
        let result = checkpoint(Architecture::default()).save(&unwritable);
        assert!(matches!(result, Err(Error::CheckpointIo { .. })));
    }
}
