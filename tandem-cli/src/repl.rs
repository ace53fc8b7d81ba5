//! Prompt commands and the test tone.

use std::f64::consts::PI;
use tandem_link::AudioFrame;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set { key: String, value: serde_json::Value },
    Get { key: String },
    Keys,
    Tone,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  set <key> <value>   store a value (JSON, or plain text)
  get <key>           show a value and its version
  keys                list stored keys
  tone                send a one-second test tone to the peer
  status              show the connection status
  quit                leave";

/// Parse a prompt line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "set" => {
            let (key, raw) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: set <key> <value>")?;
            let raw = raw.trim();
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()));
            Command::Set {
                key: key.to_owned(),
                value,
            }
        }
        "get" if !rest.is_empty() => Command::Get {
            key: rest.to_owned(),
        },
        "get" => return Err("usage: get <key>".into()),
        "keys" => Command::Keys,
        "tone" => Command::Tone,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    Ok(Some(command))
}

/// A sine tone cut into frames of `frame_ms`.
pub fn tone_frames(freq_hz: f64, secs: f64, sample_rate: u32, frame_ms: u32) -> Vec<AudioFrame> {
    let total = (secs * sample_rate as f64).round() as usize;
    let per_frame = ((sample_rate * frame_ms) / 1000).max(1) as usize;
    let amplitude = i16::MAX as f64 * 0.25;

    let samples: Vec<i16> = (0..total)
        .map(|n| {
            let t = n as f64 / sample_rate as f64;
            (amplitude * (2.0 * PI * freq_hz * t).sin()) as i16
        })
        .collect();

    samples
        .chunks(per_frame)
        .map(|chunk| AudioFrame {
            sample_rate,
            pcm: chunk.to_vec(),
        })
        .collect()
}
