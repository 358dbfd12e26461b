//! User notification channel.

use async_trait::async_trait;
use listingflow_shared::{AnalysisResult, Envelope};
use tracing::info;

/// Delivers a text message to an interactive session.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// `Err` carries a human-readable reason. Failures are logged by the
    /// caller and never retried.
    async fn send(&self, session_id: &str, text: &str) -> Result<(), String>;
}

/// Writes notifications to the log instead of a chat.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, session_id: &str, text: &str) -> Result<(), String> {
        info!(session_id, "notification:\n{text}");
        Ok(())
    }
}

/// Text of the analysis notification for a scored envelope.
pub fn format_message(envelope: &Envelope, analysis: &AnalysisResult) -> String {
    let url = envelope
        .payload
        .listing
        .as_ref()
        .map(|l| l.url.as_str())
        .filter(|u| !u.is_empty())
        .or(envelope.payload.url.as_deref())
        .unwrap_or("n/a");

    format!(
        "Listing {id}\nURL: {url}\nScore: {score}\nInvestment attractiveness: {label}\nEstimated yield: {yield_:.1}%",
        id = envelope.meta.subject_id,
        score = analysis.score,
        label = analysis.attractiveness_label.as_str(),
        yield_ = analysis.estimated_yield,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use listingflow_shared::Attractiveness;

    #[test]
    fn message_carries_result() {
        let envelope = Envelope::new(
            "305548024",
            "trace-1",
            Some("chat-9".into()),
            "https://spb.cian.ru/rent/flat/305548024/",
        );
        let analysis = AnalysisResult {
            score: 7,
            attractiveness_label: Attractiveness::High,
            estimated_yield: 3.5,
        };
        let text = format_message(&envelope, &analysis);
        assert!(text.contains("Listing 305548024"));
        assert!(text.contains("https://spb.cian.ru/rent/flat/305548024/"));
        assert!(text.contains("Investment attractiveness: High"));
        assert!(text.contains("Estimated yield: 3.5%"));
    }

    #[tokio::test]
    async fn log_channel_accepts() {
        assert!(LogChannel.send("chat-9", "hello").await.is_ok());
    }
}
