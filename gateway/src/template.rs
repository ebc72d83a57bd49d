//! Session-parameter substitution in the local config templates.
//!
//! The compute engine and its party roster are configured through plain-text
//! files carrying literal placeholder tokens. Rendered content is written to
//! a temp file in the target directory and renamed into place, so a crash
//! mid-write can never leave a half-written config behind a restart.

use std::path::Path;

use anyhow::Context;

use crate::config::GatewayConfig;
use crate::task::TaskSpec;

/// Rewrite both config templates with this task's session parameters.
pub async fn apply_session_params(cfg: &GatewayConfig, spec: &TaskSpec) -> anyhow::Result<()> {
    let counterparty = spec.counterparty.clone().unwrap_or_default();

    render_in_place(
        &cfg.engine_config_path,
        &[
            ("_NODE_NAME_", spec.owner.as_str()),
            ("_NODE_ENGINE_URL_", spec.engine_endpoint.as_str()),
        ],
    )
    .await?;

    render_in_place(
        &cfg.party_info_path,
        &[
            ("_NODE_NAME_", spec.owner.as_str()),
            ("_NODE_PUBKEY_", spec.owner_public_key.as_str()),
            ("_NODE_SERVER_URL_", spec.owner_endpoint.as_str()),
            ("_PARTY_NAME_", counterparty.party_id.as_str()),
            ("_PARTY_PUBKEY_", counterparty.public_key.as_str()),
            ("_PARTY_SERVER_URL_", counterparty.endpoint.as_str()),
        ],
    )
    .await?;

    Ok(())
}

/// Substitute placeholder tokens in one file and replace it atomically.
pub async fn render_in_place(path: &Path, replacements: &[(&str, &str)]) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read template {}", path.display()))?;

    let mut rendered = content;
    for (token, value) in replacements {
        rendered = rendered.replace(token, value);
    }

    write_replace(path, rendered).await
}

async fn write_replace(path: &Path, content: String) -> anyhow::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        use std::io::Write as _;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())
            .context("write rendered config")?;
        tmp.persist(&path)
            .with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    })
    .await
    .context("join config write")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholders_are_replaced_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        tokio::fs::write(&path, "name: _NODE_NAME_\nengine: _NODE_ENGINE_URL_\n").await?;

        render_in_place(
            &path,
            &[
                ("_NODE_NAME_", "alice"),
                ("_NODE_ENGINE_URL_", "http://engine:8003"),
            ],
        )
        .await?;

        let rendered = tokio::fs::read_to_string(&path).await?;
        anyhow::ensure!(rendered == "name: alice\nengine: http://engine:8003\n");
        anyhow::ensure!(!rendered.contains("_NODE_"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_template_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("missing.yml");
        let result = render_in_place(&path, &[("_NODE_NAME_", "alice")]).await;
        anyhow::ensure!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_tokens_are_all_replaced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("party_info.json");
        tokio::fs::write(&path, r#"{"self":"_NODE_NAME_","peer_of":"_NODE_NAME_"}"#).await?;

        render_in_place(&path, &[("_NODE_NAME_", "alice")]).await?;

        let rendered = tokio::fs::read_to_string(&path).await?;
        anyhow::ensure!(rendered == r#"{"self":"alice","peer_of":"alice"}"#);
        Ok(())
    }
}
