use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use lexi_narration::{
    init_logging, BlobStore, NarrationFactory, NarrationSession, NarrationSettings,
    PrepareInput, ProviderConfig, ProviderRequest,
};

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: lexi-narrate <text-file> [provider]");
    };
    let requested: ProviderRequest = match args.next() {
        Some(name) => name.parse()?,
        None => ProviderRequest::Auto,
    };

    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    let content = PrepareInput::from_text(path.clone(), text);
    let words: Vec<String> = content.tokens.iter().map(|t| t.text.clone()).collect();

    let settings = NarrationSettings::from_env();
    let factory = NarrationFactory::from_settings(&settings, BlobStore::new());
    let session = NarrationSession::new(factory);

    let Some(result) = session
        .load(content, requested, &ProviderConfig::default())
        .await?
    else {
        bail!("Narration was interrupted before it started");
    };
    info!(provider = %result.provider, words = words.len(), "Narrating");

    session.play().await;

    let mut last_word = None;
    loop {
        session.pump();
        let word = session.highlighted_word();
        if word != last_word {
            if let Some(word) = word.and_then(|i| words.get(i)) {
                info!(word = %word, "Speaking");
            }
            last_word = word;
        }

        let status = session.status();
        if let Some(error) = status.last_error.as_ref() {
            bail!("Narration failed: {}", error);
        }
        if status.ended {
            break;
        }
        drop(status);

        tokio::time::sleep(PUMP_INTERVAL).await;
    }

    info!("Done");
    Ok(())
}
