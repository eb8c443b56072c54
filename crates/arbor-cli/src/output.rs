//! Human and JSON rendering shared by every command.

use std::io::{self, Write};

use arbor_core::Task;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Write `value` as pretty JSON followed by a newline.
pub fn render_json<T: Serialize + ?Sized>(w: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *w, value)?;
    writeln!(w)?;
    Ok(())
}

/// One-line summary: `#12 [x] body`, indented by `depth`.
pub fn task_line(w: &mut dyn Write, task: &Task, depth: usize) -> io::Result<()> {
    let mark = if task.is_deleted() {
        '-'
    } else if task.is_completed() {
        'x'
    } else {
        ' '
    };
    writeln!(w, "{:indent$}#{} [{mark}] {}", "", task.id, task.body, indent = depth * 2)
}

pub fn tasks<'a>(
    w: &mut dyn Write,
    mode: OutputMode,
    tasks: impl IntoIterator<Item = &'a Task>,
) -> anyhow::Result<()> {
    let tasks: Vec<&Task> = tasks.into_iter().collect();
    if mode.is_json() {
        return render_json(w, &tasks);
    }
    if tasks.is_empty() {
        writeln!(w, "no tasks")?;
    }
    for task in tasks {
        task_line(w, task, 0)?;
    }
    Ok(())
}

/// Left-aligned key/value line.
pub fn kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<10} {}", format!("{key}:"), value.as_ref())
}

/// RFC 3339 rendering of a microsecond timestamp.
pub fn timestamp(us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(us)
        .map_or_else(|| us.to_string(), |at| at.to_rfc3339())
}

pub fn success(w: &mut dyn Write, mode: OutputMode, message: &str) -> anyhow::Result<()> {
    if mode.is_json() {
        render_json(w, &serde_json::json!({ "ok": true, "message": message }))
    } else {
        writeln!(w, "{message}")?;
        Ok(())
    }
}
