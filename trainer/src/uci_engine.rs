use crate::error::{Error, Result};
use log::{debug, warn};
use nn::label::Score;
use shakmaty::fen::Fen;
use shakmaty::{Chess, EnPassantMode, Position};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How long the engine gets to exit after `quit` before it is killed
const QUIT_GRACE: Duration = Duration::from_millis(500);

/// Something that can score positions from the side to move's perspective
pub trait Analyzer {
    fn analyze(&mut self, position: &Chess) -> Result<Score>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable
    pub path: PathBuf,
    /// Target depth for the search
    pub depth: u32,
    pub threads: u32,
    /// Transposition table size in MB
    pub hash_mb: u32,
}

#[derive(Debug)]
pub struct EngineResult {
    pub score: Score,
    pub best_move: String,
}

/// Simple UCI engine wrapper to evaluate positions
/// https://www.wbec-ridderkerk.nl/html/UCIProtocol.html
///
/// The process is owned by this value and shut down when it is dropped.
pub struct UciEngine {
    depth: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl UciEngine {
    /// Starts the engine, completes the UCI handshake and applies the options
    pub fn spawn(config: &EngineConfig) -> Result<Self> {
        let mut child = Command::new(&config.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::ExternalEngine(format!("failed to start {}: {}", config.path.display(), e))
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, BufReader::new(stdout)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::ExternalEngine("engine pipes unavailable".to_string()));
            }
        };

        let mut engine = UciEngine {
            depth: config.depth,
            child,
            stdin,
            stdout,
        };

        engine.send("uci")?;
        engine.wait_for("uciok")?;
        engine.send(&format!("setoption name Threads value {}", config.threads))?;
        engine.send(&format!("setoption name Hash value {}", config.hash_mb))?;
        engine.send("isready")?;
        engine.wait_for("readyok")?;

        debug!(
            "engine {} ready (depth {}, threads {}, hash {}MB)",
            config.path.display(),
            config.depth,
            config.threads,
            config.hash_mb
        );

        Ok(engine)
    }

    fn send(&mut self, command: &str) -> Result<()> {
        writeln!(self.stdin, "{}", command)
            .and_then(|_| self.stdin.flush())
            .map_err(|e| Error::ExternalEngine(format!("failed to send '{}': {}", command, e)))
    }

    fn read_line(&mut self, line: &mut String) -> Result<()> {
        line.clear();
        match self.stdout.read_line(line) {
            Ok(0) => Err(Error::ExternalEngine("engine closed its output".to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(Error::ExternalEngine(format!("failed to read from engine: {}", e))),
        }
    }

    /// Skips lines until one starts with `token`
    fn wait_for(&mut self, token: &str) -> Result<()> {
        let mut line = String::new();
        loop {
            self.read_line(&mut line)?;
            if line.trim_start().starts_with(token) {
                return Ok(());
            }
        }
    }

    pub fn evaluate_fen(&mut self, fen: &str) -> Result<EngineResult> {
        self.send(&format!("position fen {}", fen))?;
        self.send(&format!("go depth {}", self.depth))?;

        // keep the last reported score until the search is done
        let mut score = None;
        let mut line = String::new();

        loop {
            self.read_line(&mut line)?;
            let trimmed = line.trim();

            if trimmed.starts_with("info") {
                if let Some(s) = parse_info_score(trimmed) {
                    score = Some(s);
                }
            } else if let Some(rest) = trimmed.strip_prefix("bestmove") {
                let best_move = rest.split_whitespace().next().unwrap_or("(none)").to_string();

                return match score {
                    Some(score) => Ok(EngineResult { score, best_move }),
                    None => Err(Error::ExternalEngine(format!("no score reported for {}", fen))),
                };
            }
        }
    }
}

impl Analyzer for UciEngine {
    fn analyze(&mut self, position: &Chess) -> Result<Score> {
        let fen = Fen(position.clone().into_setup(EnPassantMode::Legal));
        Ok(self.evaluate_fen(&fen.to_string())?.score)
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        let _ = self.send("quit");

        let start = Instant::now();
        while start.elapsed() < QUIT_GRACE {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }

        warn!("engine did not exit after quit, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Extracts the score of an `info` line, if it carries one
pub fn parse_info_score(line: &str) -> Option<Score> {
    let mut parts = line.split_whitespace();
    parts.position(|p| p == "score")?;

    let kind = parts.next()?;
    let value = parts.next()?.parse::<i32>().ok()?;

    match kind {
        "cp" => Some(Score::Cp(value)),
        "mate" => Some(Score::Mate(value)),
        _ => None,
    }
}
