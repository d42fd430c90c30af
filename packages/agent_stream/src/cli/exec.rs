//! `agent-stream exec`: run one file through the execution service.

use std::path::Path;

use anyhow::{Context, Result};

use agent_stream::{CodeExecutor, ExecutionConfig, PistonExecutor};

/// Piston language name for a file extension.
fn language_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "py" => "python",
        "js" | "mjs" => "javascript",
        "ts" => "typescript",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "c" => "c",
        "cc" | "cpp" | "cxx" => "c++",
        "rb" => "ruby",
        "sh" => "bash",
        _ => return None,
    })
}

pub async fn exec_command(
    config: &ExecutionConfig,
    path: &Path,
    language: Option<&str>,
) -> Result<()> {
    let language = match language.or_else(|| language_for(path)) {
        Some(language) => language,
        None => anyhow::bail!(
            "Cannot tell the language of {}; pass --language",
            path.display()
        ),
    };
    let code = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let executor = PistonExecutor::new(config)?;
    let result = executor.execute(&code, language).await;

    print!("{}", result.output);
    if let Some(error) = &result.error {
        eprintln!("{error}");
    }
    let outcome = if result.success { "ok" } else { "failed" };
    eprintln!("[{outcome} in {:.2}s]", result.runtime.as_secs_f64());

    if !result.success {
        anyhow::bail!("execution failed");
    }
    Ok(())
}
