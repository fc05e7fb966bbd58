//! Per-provider transcript aggregation.
//!
//! Each provider's events arrive in that provider's own order; there is no
//! ordering between providers. The aggregator keeps, per provider, an
//! append-only history of final parts and at most one replaceable non-final
//! part, plus a status/error line for display.

use serde::Serialize;
use std::collections::HashMap;

use crate::protocol::{ProviderId, ServerEvent, Transcript, ERR_KEY_NOT_PROVIDED};

/// Display state for one provider's pane.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderOutput {
    /// Transient status line ("connecting", "not provided"). Cleared the
    /// instant the first transcript or error arrives.
    pub status_message: Option<String>,
    /// Terminal until the session restarts.
    pub error: Option<String>,
    /// Confirmed segments, in the provider's emission order.
    pub final_parts: Vec<Transcript>,
    /// The single in-flight provisional segment, if any.
    pub non_final: Option<Transcript>,
}

/// Consumes tagged server events and maintains one `ProviderOutput` per
/// provider.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    outputs: HashMap<ProviderId, ProviderOutput>,
    /// Session-scoped error (no provider tag), e.g. zero credentialed
    /// providers.
    pub session_error: Option<String>,
}

impl TranscriptAggregator {
    /// Seed panes for every known provider. Credentialed providers start in
    /// "connecting", the rest in "not provided".
    pub fn new(credentialed: &[ProviderId]) -> Self {
        let mut outputs = HashMap::new();
        for provider in ProviderId::ALL {
            let status = if credentialed.contains(&provider) {
                "connecting"
            } else {
                "not provided"
            };
            outputs.insert(
                provider,
                ProviderOutput {
                    status_message: Some(status.to_string()),
                    ..Default::default()
                },
            );
        }
        Self {
            outputs,
            session_error: None,
        }
    }

    /// Apply one inbound event.
    pub fn apply(&mut self, event: &ServerEvent) {
        let Some(provider) = event.provider else {
            if let Some(error) = &event.error {
                self.session_error = Some(error.clone());
            }
            return;
        };

        let output = self.outputs.entry(provider).or_default();

        if let Some(error) = &event.error {
            if error == ERR_KEY_NOT_PROVIDED {
                // Missing credential is a configuration state, not a failure.
                output.status_message = Some("not provided".to_string());
            } else {
                output.error = Some(error.clone());
                output.status_message = None;
            }
            return;
        }

        if let Some(transcript) = &event.transcript {
            output.status_message = None;
            if transcript.is_final {
                output.final_parts.push(transcript.clone());
                output.non_final = None;
            } else {
                output.non_final = Some(transcript.clone());
            }
        }
    }

    pub fn output(&self, provider: ProviderId) -> Option<&ProviderOutput> {
        self.outputs.get(&provider)
    }

    /// Assembled final text for one provider.
    pub fn final_text(&self, provider: ProviderId) -> String {
        self.outputs
            .get(&provider)
            .map(|o| {
                o.final_parts
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(text: &str, is_final: bool) -> Transcript {
        Transcript {
            text: text.to_string(),
            speaker: None,
            start_ms: None,
            end_ms: None,
            confidence: None,
            is_final,
        }
    }

    #[test]
    fn credentialed_starts_connecting_rest_not_provided() {
        let agg = TranscriptAggregator::new(&[ProviderId::Deepgram]);
        assert_eq!(
            agg.output(ProviderId::Deepgram).unwrap().status_message,
            Some("connecting".to_string())
        );
        assert_eq!(
            agg.output(ProviderId::Speechmatics).unwrap().status_message,
            Some("not provided".to_string())
        );
    }

    #[test]
    fn final_nonfinal_final_leaves_two_finals_and_empty_slot() {
        let mut agg = TranscriptAggregator::new(&ProviderId::ALL);
        let p = ProviderId::Deepgram;

        agg.apply(&ServerEvent::transcript(p, transcript("one", true)));
        agg.apply(&ServerEvent::transcript(p, transcript("partial", false)));
        agg.apply(&ServerEvent::transcript(p, transcript("two", true)));

        let output = agg.output(p).unwrap();
        assert_eq!(output.final_parts.len(), 2);
        assert_eq!(output.final_parts[0].text, "one");
        assert_eq!(output.final_parts[1].text, "two");
        assert!(output.non_final.is_none());
        assert_eq!(agg.final_text(p), "one two");
    }

    #[test]
    fn non_final_replaces_never_accumulates() {
        let mut agg = TranscriptAggregator::new(&ProviderId::ALL);
        let p = ProviderId::Speechmatics;

        agg.apply(&ServerEvent::transcript(p, transcript("he", false)));
        agg.apply(&ServerEvent::transcript(p, transcript("hel", false)));
        agg.apply(&ServerEvent::transcript(p, transcript("hello", false)));

        let output = agg.output(p).unwrap();
        assert!(output.final_parts.is_empty());
        assert_eq!(output.non_final.as_ref().unwrap().text, "hello");
    }

    #[test]
    fn error_clears_status_and_is_recorded() {
        let mut agg = TranscriptAggregator::new(&ProviderId::ALL);
        let p = ProviderId::Deepgram;

        agg.apply(&ServerEvent::provider_error(p, "authentication rejected"));

        let output = agg.output(p).unwrap();
        assert_eq!(output.error.as_deref(), Some("authentication rejected"));
        assert!(output.status_message.is_none());
    }

    #[test]
    fn missing_key_is_status_not_error() {
        let mut agg = TranscriptAggregator::new(&[ProviderId::Deepgram]);
        agg.apply(&ServerEvent::provider_error(
            ProviderId::Speechmatics,
            ERR_KEY_NOT_PROVIDED,
        ));

        let output = agg.output(ProviderId::Speechmatics).unwrap();
        assert!(output.error.is_none());
        assert_eq!(output.status_message.as_deref(), Some("not provided"));
    }

    #[test]
    fn first_transcript_clears_status() {
        let mut agg = TranscriptAggregator::new(&ProviderId::ALL);
        let p = ProviderId::Deepgram;

        agg.apply(&ServerEvent::transcript(p, transcript("hi", false)));
        assert!(agg.output(p).unwrap().status_message.is_none());
    }

    #[test]
    fn session_error_recorded_without_provider() {
        let mut agg = TranscriptAggregator::new(&[]);
        agg.apply(&ServerEvent::session_error("no provider credentials"));
        assert_eq!(
            agg.session_error.as_deref(),
            Some("no provider credentials")
        );
    }

    #[test]
    fn one_provider_failing_does_not_touch_the_other() {
        let mut agg = TranscriptAggregator::new(&ProviderId::ALL);

        agg.apply(&ServerEvent::provider_error(
            ProviderId::Speechmatics,
            "disconnected",
        ));
        agg.apply(&ServerEvent::transcript(
            ProviderId::Deepgram,
            transcript("still flowing", true),
        ));

        assert!(agg.output(ProviderId::Speechmatics).unwrap().error.is_some());
        let healthy = agg.output(ProviderId::Deepgram).unwrap();
        assert!(healthy.error.is_none());
        assert_eq!(healthy.final_parts.len(), 1);
    }
}
