// trace.rs - Stack frames from both runtimes rendered as one trace
//
// Engine convention:  "    at fetchUser (app.js:12:5)"
// Native convention:  "   3: tether_core::value::Value::call"
//                     "             at ./src/value.rs:210:9"

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tether_script::EngineFrame;

/// Which runtime's syntax a rendered trace uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceConvention {
    #[default]
    Native,
    Engine,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOrigin {
    Engine,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub origin: FrameOrigin,
}

impl From<&EngineFrame> for TraceFrame {
    fn from(frame: &EngineFrame) -> Self {
        let location = frame.location.as_ref();
        Self {
            function: frame.function.clone(),
            file: location.map(|l| l.file.clone()),
            line: location.map(|l| l.line),
            column: location.map(|l| l.column),
            origin: FrameOrigin::Engine,
        }
    }
}

/// Frames that only exist to carry a call across the boundary.
const PLUMBING_PREFIXES: &[&str] = &[
    "tether_core::fault::",
    "tether_core::value::Value::with_engine",
    "tether_core::callback::",
    "<tether_core::callback::",
    "tether_core::dispatcher::",
    "tether_script::heap::",
    "<tether_script::heap::",
    "std::backtrace",
    "std::panicking",
    "std::panic::",
    "core::ops::function",
    "std::sys",
    "std::rt::",
    "__rust",
];

pub fn is_plumbing(function: &str) -> bool {
    PLUMBING_PREFIXES.iter().any(|p| function.starts_with(p))
}

/// Parse the text form of a `std::backtrace::Backtrace`.
pub fn parse_native_backtrace(text: &str) -> Vec<TraceFrame> {
    let mut frames: Vec<TraceFrame> = Vec::new();
    for line in text.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let (file, line, column) = split_location(location);
                frame.file = Some(file);
                frame.line = line;
                frame.column = column;
            }
            continue;
        }
        let Some((index, function)) = line.split_once(": ") else {
            continue;
        };
        if index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() {
            frames.push(TraceFrame {
                function: function.trim().to_string(),
                file: None,
                line: None,
                column: None,
                origin: FrameOrigin::Native,
            });
        }
    }
    frames
}

/// Parse an engine-convention trace (`at fn (file:line:col)` lines).
pub fn parse_engine_trace(text: &str) -> Vec<TraceFrame> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .map(|rest| {
            let (function, location) = match rest.rfind(" (") {
                Some(open) if rest.ends_with(')') => {
                    (&rest[..open], Some(&rest[open + 2..rest.len() - 1]))
                }
                _ => ("<anonymous>", Some(rest)),
            };
            let mut frame = TraceFrame {
                function: function.to_string(),
                file: None,
                line: None,
                column: None,
                origin: FrameOrigin::Engine,
            };
            if let Some(location) = location.filter(|l| *l != "native") {
                let (file, line, column) = split_location(location);
                frame.file = Some(file);
                frame.line = line;
                frame.column = column;
            }
            frame
        })
        .collect()
}

/// Re-render a trace written in either convention into `to`.
pub fn translate_trace(text: &str, to: TraceConvention) -> String {
    let mut frames = parse_native_backtrace(text);
    if frames.is_empty() {
        frames = parse_engine_trace(text);
    }
    render_frames(&frames, to)
}

pub fn render_frames(frames: &[TraceFrame], convention: TraceConvention) -> String {
    let mut out = String::new();
    for (index, frame) in frames.iter().enumerate() {
        render_frame(&mut out, index, frame, convention);
    }
    out
}

fn render_frame(out: &mut String, index: usize, frame: &TraceFrame, convention: TraceConvention) {
    let location = frame.file.as_ref().map(|file| match (frame.line, frame.column) {
        (Some(line), Some(column)) => format!("{file}:{line}:{column}"),
        (Some(line), None) => format!("{file}:{line}"),
        _ => file.clone(),
    });
    // Writing into a String cannot fail
    let _ = match convention {
        TraceConvention::Engine => writeln!(
            out,
            "    at {} ({})",
            frame.function,
            location.as_deref().unwrap_or("native")
        ),
        TraceConvention::Native => {
            let _ = writeln!(out, "{index:>4}: {}", frame.function);
            match location {
                Some(location) => writeln!(out, "             at {location}"),
                None => Ok(()),
            }
        }
    };
}

/// Drop repeated plumbing frames across layers and collapse consecutive
/// duplicates.
pub fn elide_plumbing(layers: Vec<Vec<TraceFrame>>) -> Vec<Vec<TraceFrame>> {
    let mut seen_plumbing: Vec<String> = Vec::new();
    layers
        .into_iter()
        .map(|layer| {
            let mut kept: Vec<TraceFrame> = Vec::with_capacity(layer.len());
            for frame in layer {
                if kept.last() == Some(&frame) {
                    continue;
                }
                if frame.origin == FrameOrigin::Native && is_plumbing(&frame.function) {
                    if seen_plumbing.contains(&frame.function) {
                        continue;
                    }
                    seen_plumbing.push(frame.function.clone());
                }
                kept.push(frame);
            }
            kept
        })
        .collect()
}

fn split_location(location: &str) -> (String, Option<u32>, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let rest = parts.next();
    match (rest, middle.and_then(|m| m.parse::<u32>().ok()), last.and_then(|l| l.parse::<u32>().ok())) {
        (Some(file), Some(line), Some(column)) => (file.to_string(), Some(line), Some(column)),
        _ => match location.rsplit_once(':') {
            Some((file, line)) if line.parse::<u32>().is_ok() => {
                (file.to_string(), line.parse().ok(), None)
            }
            _ => (location.to_string(), None, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE: &str = "   0: tether_core::fault::Fault::engine
             at ./crates/tether_core/src/fault/mod.rs:120:27
   1: app::load_profile
             at ./src/main.rs:40:5
   2: std::rt::lang_start";

    #[test]
    fn test_parse_native_backtrace() {
        let frames = parse_native_backtrace(NATIVE);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].function, "app::load_profile");
        assert_eq!(frames[1].file.as_deref(), Some("./src/main.rs"));
        assert_eq!((frames[1].line, frames[1].column), (Some(40), Some(5)));
        assert_eq!(frames[2].file, None);
    }

    #[test]
    fn test_native_to_engine_translation() {
        let rendered = translate_trace(NATIVE, TraceConvention::Engine);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[1], "    at app::load_profile (./src/main.rs:40:5)");
        assert_eq!(lines[2], "    at std::rt::lang_start (native)");
    }

    #[test]
    fn test_engine_to_native_translation() {
        let text = "Error: boom\n    at fetchUser (app.js:12:5)\n    at hostCall (native)";
        let rendered = translate_trace(text, TraceConvention::Native);
        assert_eq!(
            rendered,
            "   0: fetchUser\n             at app.js:12:5\n   1: hostCall\n"
        );
    }

    #[test]
    fn test_windows_paths_keep_drive_letter() {
        let frames = parse_engine_trace("    at f (C:\\src\\app.js:3:9)");
        assert_eq!(frames[0].file.as_deref(), Some("C:\\src\\app.js"));
        assert_eq!(frames[0].line, Some(3));
    }

    #[test]
    fn test_plumbing_elided_across_layers() {
        let plumbing = TraceFrame {
            function: "tether_core::callback::Trampoline::invoke".to_string(),
            file: None,
            line: None,
            column: None,
            origin: FrameOrigin::Native,
        };
        let user = TraceFrame {
            function: "app::handler".to_string(),
            ..plumbing.clone()
        };
        let layers = elide_plumbing(vec![
            vec![plumbing.clone(), user.clone(), user.clone()],
            vec![plumbing.clone(), user.clone()],
        ]);
        assert_eq!(layers[0], vec![plumbing, user.clone()]);
        assert_eq!(layers[1], vec![user]);
    }
}
