pub mod cache;
pub mod source;

use crate::error::{Error, Result};
use crate::game_visitor::GameVisitor;
use crate::uci_engine::{Analyzer, EngineConfig, UciEngine};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use log::{info, warn};
use nn::feature_set::basic::Basic;
use nn::feature_set::FeatureVector;
use nn::label::{label_from_outcome, label_from_score};
use pgn_reader::BufferedReader;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Position};
use std::fmt::{Display, Formatter};
use std::io::{self, Read};
use std::path::Path;

pub use cache::{load_cached, save_cache};

/// An encoded position and its target value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledExample {
    pub features: FeatureVector,
    pub label: f32,
}

/// Where labels come from. A corpus uses a single policy
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Score of the external analysis engine
    Engine,
    /// Final result of the game
    Outcome,
}

impl Display for LabelPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelPolicy::Engine => write!(f, "engine"),
            LabelPolicy::Outcome => write!(f, "outcome"),
        }
    }
}

/// How a corpus was produced, stored in the cache and carried into model metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Provenance {
    pub source: String,
    pub created: String,
    pub label_policy: LabelPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_depth: Option<u32>,
    pub max_games: u64,
    pub positions_per_game: usize,
    pub seed: u64,
    pub games_read: u64,
    pub games_skipped: u64,
}

impl Provenance {
    /// First setting this corpus was built with that differs from the requested ones.
    /// The source is only compared when one is given
    pub fn mismatch(
        &self,
        source: Option<&str>,
        params: &BuildParams,
        engine: Option<&EngineConfig>,
    ) -> Option<String> {
        if let Some(source) = source {
            if self.source != source {
                return Some(format!("source {} instead of {}", self.source, source));
            }
        }
        if self.label_policy != params.label_policy {
            return Some(format!(
                "the {} label policy instead of {}",
                self.label_policy, params.label_policy
            ));
        }
        if self.max_games != params.max_games {
            return Some(format!("max games {} instead of {}", self.max_games, params.max_games));
        }
        if self.positions_per_game != params.positions_per_game {
            return Some(format!(
                "{} positions per game instead of {}",
                self.positions_per_game, params.positions_per_game
            ));
        }
        if self.seed != params.seed {
            return Some(format!("seed {} instead of {}", self.seed, params.seed));
        }
        if let (LabelPolicy::Engine, Some(config)) = (params.label_policy, engine) {
            match self.engine_depth {
                Some(depth) if depth == config.depth => {}
                Some(depth) => {
                    return Some(format!("engine depth {} instead of {}", depth, config.depth))
                }
                None => return Some(format!("no engine depth instead of {}", config.depth)),
            }
        }
        None
    }
}

/// An ordered collection of labeled examples
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    pub examples: Vec<LabeledExample>,
    pub provenance: Provenance,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BuildParams {
    /// Maximum number of game records consumed, malformed ones included
    pub max_games: u64,
    /// Maximum number of positions kept per game
    pub positions_per_game: usize,
    pub label_policy: LabelPolicy,
    /// Seed of the per-game position sampling
    pub seed: u64,
}

impl BuildParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_games == 0 {
            return Err(Error::Configuration("max games must be positive".to_string()));
        }
        if self.positions_per_game == 0 {
            return Err(Error::Configuration("positions per game must be positive".to_string()));
        }
        Ok(())
    }
}

/// Sampled positions in game order: all of them if there are at most `limit`,
/// otherwise a uniform random subset of size `limit`
fn sample_positions<'a>(
    candidates: Vec<&'a Chess>,
    limit: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<&'a Chess> {
    if candidates.len() <= limit {
        return candidates;
    }

    let mut picked = rand::seq::index::sample(rng, candidates.len(), limit).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| candidates[i]).collect()
}

/// Reads games and extracts labeled examples.
///
/// `analyzer` is only consulted under the engine policy, and only for the
/// positions that survive sampling.
pub fn build_from_games<R: Read>(
    reader: R,
    source_name: &str,
    params: &BuildParams,
    mut analyzer: Option<&mut dyn Analyzer>,
) -> Result<Corpus> {
    params.validate()?;
    if params.label_policy == LabelPolicy::Engine && analyzer.is_none() {
        return Err(Error::Configuration(
            "the engine label policy needs an analysis engine".to_string(),
        ));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let mut game_reader = BufferedReader::new(reader);
    let mut visitor = GameVisitor::new();

    let mut examples = vec![];
    let mut games_read = 0;
    let mut games_skipped = 0;

    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [Elapsed {elapsed_precise}] [Games {human_pos} @ {per_sec}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    while games_read < params.max_games {
        let Some(game) = game_reader.read_game(&mut visitor)? else {
            break;
        };
        games_read += 1;
        bar.inc(1);

        let game = match game {
            Ok(game) => game,
            Err(malformed) => {
                warn!("skipping game {}: {}", games_read, malformed.reason);
                games_skipped += 1;
                continue;
            }
        };

        let outcome = match params.label_policy {
            LabelPolicy::Outcome => match game.outcome {
                Some(outcome) => Some(outcome),
                None => {
                    // unfinished games carry no target under this policy
                    games_skipped += 1;
                    continue;
                }
            },
            LabelPolicy::Engine => None,
        };

        let candidates: Vec<&Chess> = game.candidates().collect();
        for position in sample_positions(candidates, params.positions_per_game, &mut rng) {
            let label = match (outcome, analyzer.as_deref_mut()) {
                (Some(outcome), _) => label_from_outcome(outcome, position.turn()),
                (None, Some(analyzer)) => label_from_score(analyzer.analyze(position)?),
                (None, None) => unreachable!("checked above"),
            };

            examples.push(LabeledExample {
                features: Basic::encode(position),
                label,
            });
        }

        bar.set_message(format!("[Positions {}]", HumanCount(examples.len() as u64)));
    }
    bar.finish_and_clear();

    if examples.is_empty() {
        return Err(Error::DataExhausted {
            games_read,
            games_skipped,
        });
    }

    info!(
        "extracted {} positions from {} games ({} skipped)",
        examples.len(),
        games_read,
        games_skipped
    );

    Ok(Corpus {
        examples,
        provenance: Provenance {
            source: source_name.to_string(),
            created: chrono::Utc::now().to_rfc3339(),
            label_policy: params.label_policy,
            engine_depth: None,
            max_games: params.max_games,
            positions_per_game: params.positions_per_game,
            seed: params.seed,
            games_read,
            games_skipped,
        },
    })
}

/// Builds a corpus from a PGN location (path or URL), starting the engine when the policy needs it
pub fn build_from_source(
    location: &str,
    params: &BuildParams,
    engine: Option<&EngineConfig>,
) -> Result<Corpus> {
    params.validate()?;
    info!("reading games from {}", location);

    let reader = source::open(location)?;

    match params.label_policy {
        LabelPolicy::Engine => {
            let config = engine.ok_or_else(|| {
                Error::Configuration("the engine label policy needs an engine path".to_string())
            })?;
            // dropped (and shut down) on every exit path
            let mut uci = UciEngine::spawn(config)?;
            let mut corpus = build_from_games(reader, location, params, Some(&mut uci))?;
            corpus.provenance.engine_depth = Some(config.depth);
            Ok(corpus)
        }
        LabelPolicy::Outcome => build_from_games(reader, location, params, None),
    }
}

/// Loads the cached corpus, rebuilding it from `source` when the cache is missing, invalid
/// or was built with other parameters
pub fn load_or_build(
    cache_path: &Path,
    source: Option<&str>,
    params: &BuildParams,
    engine: Option<&EngineConfig>,
) -> Result<Corpus> {
    match load_cached(cache_path) {
        Ok(corpus) => match corpus.provenance.mismatch(source, params, engine) {
            None => {
                info!("loaded {} positions from {}", corpus.len(), cache_path.display());
                return Ok(corpus);
            }
            Some(reason) if source.is_some() => {
                warn!(
                    "dataset cache {} was built with {}, rebuilding",
                    cache_path.display(),
                    reason
                );
            }
            Some(reason) => {
                return Err(Error::Configuration(format!(
                    "dataset cache {} was built with {} and there is no source to rebuild it",
                    cache_path.display(),
                    reason
                )));
            }
        },
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound && source.is_some() => {
            info!("no dataset cache at {}, building it", cache_path.display());
        }
        Err(Error::CacheFormat(reason)) if source.is_some() => {
            warn!("discarding dataset cache {}: {}", cache_path.display(), reason);
        }
        Err(e) => return Err(e),
    }

    let location = source.ok_or_else(|| {
        Error::Configuration("no game source to build the dataset".to_string())
    })?;
    let corpus = build_from_source(location, params, engine)?;
    save_cache(&corpus, cache_path)?;
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nn::label::Score;
    use std::collections::HashSet;

    /// Scores every position by its number of legal moves, counting calls
    struct CountingAnalyzer {
        calls: usize,
    }

    impl Analyzer for CountingAnalyzer {
        fn analyze(&mut self, position: &Chess) -> Result<Score> {
            self.calls += 1;
            Ok(Score::Cp(position.legal_moves().len() as i32))
        }
    }

    fn params(policy: LabelPolicy, max_games: u64, per_game: usize) -> BuildParams {
        BuildParams {
            max_games,
            positions_per_game: per_game,
            label_policy: policy,
            seed: 1,
        }
    }

    const LONG_GAME: &str =
        "[Result \"1-0\"]\n\n1. e4 e5 2. Nf3 Nc6 3. Bb5 a6 4. Ba4 Nf6 5. O-O Be7 1-0\n\n";

    #[test]
    fn test_sampling_limits_engine_calls() {
        let mut analyzer = CountingAnalyzer { calls: 0 };
        let corpus = build_from_games(
            LONG_GAME.as_bytes(),
            "test",
            &params(LabelPolicy::Engine, 10, 4),
            Some(&mut analyzer),
        )
        .unwrap();

        assert_eq!(corpus.len(), 4);
        assert_eq!(analyzer.calls, 4);
        assert_eq!(corpus.provenance.games_read, 1);

        // distinct positions from the game
        let unique: HashSet<_> = corpus.examples.iter().map(|e| e.features).collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let build = |seed| {
            let mut p = params(LabelPolicy::Outcome, 10, 3);
            p.seed = seed;
            build_from_games(LONG_GAME.as_bytes(), "test", &p, None).unwrap().examples
        };

        assert_eq!(build(5), build(5));
    }

    #[test]
    fn test_outcome_policy_labels() {
        let p = params(LabelPolicy::Outcome, 10, 100);
        let corpus = build_from_games(LONG_GAME.as_bytes(), "test", &p, None).unwrap();

        // 10 plies, every position has replies; white wins
        assert_eq!(corpus.len(), 10);
        for (i, example) in corpus.examples.iter().enumerate() {
            // after an odd number of plies black is to move
            let expected = if i % 2 == 0 { -1.0 } else { 1.0 };
            assert_eq!(example.label, expected);
        }
    }

    #[test]
    fn test_unfinished_games_skipped_under_outcome_policy() {
        let pgn = "1. e4 e5 *\n\n1. d4 d5 1/2-1/2\n\n";
        let p = params(LabelPolicy::Outcome, 10, 10);
        let corpus = build_from_games(pgn.as_bytes(), "test", &p, None).unwrap();

        assert_eq!(corpus.len(), 2);
        assert!(corpus.examples.iter().all(|e| e.label == 0.0));
        assert_eq!(corpus.provenance.games_read, 2);
        assert_eq!(corpus.provenance.games_skipped, 1);
    }

    #[test]
    fn test_max_games_counts_malformed() {
        let pgn = "1. e4 Ke7 Ke3 *\n\n1. d4 d5 1-0\n\n1. c4 c5 1-0\n\n";
        let p = params(LabelPolicy::Outcome, 2, 10);
        let corpus = build_from_games(pgn.as_bytes(), "test", &p, None).unwrap();

        // the malformed first game uses one of the two slots
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.provenance.games_read, 2);
        assert_eq!(corpus.provenance.games_skipped, 1);
    }

    #[test]
    fn test_data_exhausted() {
        let pgn = "1. e4 e5 *\n\n";
        let p = params(LabelPolicy::Outcome, 10, 10);
        let result = build_from_games(pgn.as_bytes(), "test", &p, None);

        assert!(matches!(
            result,
            Err(Error::DataExhausted {
                games_read: 1,
                games_skipped: 1
            })
        ));
    }

    #[test]
    fn test_engine_policy_requires_engine() {
        let p = params(LabelPolicy::Engine, 10, 10);
        let result = build_from_games(LONG_GAME.as_bytes(), "test", &p, None);
        assert!(matches!(result, Err(Error::Configuration(_))));

        let p = params(LabelPolicy::Outcome, 10, 0);
        let result = build_from_games(LONG_GAME.as_bytes(), "test", &p, None);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    /// A source file with the long game and a cache path next to it, the cache not written yet
    fn source_and_cache() -> (tempfile::TempDir, String, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("games.pgn");
        std::fs::write(&source, LONG_GAME).unwrap();
        let cache = dir.path().join("positions.cache");
        let source = source.to_str().unwrap().to_string();
        (dir, source, cache)
    }

    #[test]
    fn test_load_or_build_writes_and_reuses_cache() {
        let (_dir, source, cache) = source_and_cache();
        let p = params(LabelPolicy::Outcome, 10, 4);

        let built = load_or_build(&cache, Some(&source), &p, None).unwrap();
        assert_eq!(built.len(), 4);
        assert!(cache.exists());

        // same parameters, no source needed
        assert_eq!(load_or_build(&cache, None, &p, None).unwrap(), built);
        assert_eq!(load_or_build(&cache, Some(&source), &p, None).unwrap(), built);
    }

    #[test]
    fn test_load_or_build_without_source() {
        let (_dir, _source, cache) = source_and_cache();

        let result = load_or_build(&cache, None, &params(LabelPolicy::Outcome, 10, 4), None);
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound));
        assert!(!cache.exists());
    }

    #[test]
    fn test_load_or_build_rebuilds_invalid_cache() {
        let (_dir, source, cache) = source_and_cache();
        let p = params(LabelPolicy::Outcome, 10, 4);
        std::fs::write(&cache, b"not a cache").unwrap();

        assert!(matches!(load_or_build(&cache, None, &p, None), Err(Error::CacheFormat(_))));

        let corpus = load_or_build(&cache, Some(&source), &p, None).unwrap();
        assert_eq!(corpus.len(), 4);
        assert_eq!(load_cached(&cache).unwrap(), corpus);
    }

    #[test]
    fn test_load_or_build_rejects_other_parameters() {
        let (_dir, source, cache) = source_and_cache();
        let p = params(LabelPolicy::Outcome, 10, 2);
        load_or_build(&cache, Some(&source), &p, None).unwrap();

        let requested = [
            BuildParams {
                positions_per_game: 6,
                ..p.clone()
            },
            BuildParams { seed: 9, ..p.clone() },
            BuildParams {
                max_games: 5,
                ..p.clone()
            },
            BuildParams {
                label_policy: LabelPolicy::Engine,
                ..p.clone()
            },
        ];
        for other in &requested {
            let result = load_or_build(&cache, None, other, None);
            assert!(matches!(result, Err(Error::Configuration(_))), "{:?} accepted", other);
        }

        // a different source is never served from this cache
        let elsewhere = cache.with_file_name("other.pgn");
        std::fs::write(&elsewhere, "1. d4 d5 2. c4 e6 3. Nc3 Nf6 4. Bg5 Be7 0-1\n\n").unwrap();
        let elsewhere = elsewhere.to_str().unwrap();
        let corpus = load_or_build(&cache, Some(elsewhere), &p, None).unwrap();
        assert_eq!(corpus.provenance.source, elsewhere);

        // with a source the cache is rebuilt for the new parameters
        let wider = BuildParams {
            positions_per_game: 6,
            seed: 9,
            ..p.clone()
        };
        let corpus = load_or_build(&cache, Some(&source), &wider, None).unwrap();
        assert_eq!(corpus.len(), 6);
        assert_eq!(corpus.provenance.positions_per_game, 6);
        assert_eq!(corpus.provenance.seed, 9);
        assert_eq!(load_cached(&cache).unwrap(), corpus);
    }

    #[test]
    fn test_mismatch_engine_depth() {
        let corpus = build_from_games(
            LONG_GAME.as_bytes(),
            "test",
            &params(LabelPolicy::Engine, 10, 2),
            Some(&mut CountingAnalyzer { calls: 0 }),
        )
        .unwrap();
        let mut provenance = corpus.provenance;
        provenance.engine_depth = Some(8);

        let engine = |depth| EngineConfig {
            path: "stockfish".into(),
            depth,
            threads: 1,
            hash_mb: 16,
        };
        let p = params(LabelPolicy::Engine, 10, 2);

        assert_eq!(provenance.mismatch(Some("test"), &p, Some(&engine(8))), None);
        assert_eq!(provenance.mismatch(None, &p, None), None);
        assert!(provenance.mismatch(None, &p, Some(&engine(12))).is_some());
        assert!(provenance.mismatch(Some("other"), &p, None).is_some());
    }
}
