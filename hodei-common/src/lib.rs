pub mod config;
pub mod model;
pub mod retries;
pub mod tracing;

/// Render a value for logging with secrets masked. Configs implement this
/// instead of `Display` so that dumping them at startup is always safe.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
test_r::enable!();
