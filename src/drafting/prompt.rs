//! Bounded prompt assembly

use chrono_tz::Tz;

use crate::config::DraftingConfig;
use crate::models::{AggregatedContext, InboundMessage, ScheduleEntry};

const MAX_BODY_CHARS: usize = 4_000;
const MAX_KNOWLEDGE_CHARS: usize = 400;
const MAX_TURN_CHARS: usize = 300;

pub fn system_prompt(signature: &str) -> String {
    format!(
        "You are an assistant drafting email replies on behalf of a {signature}.\n\
         Write to parents and families in a friendly, professional voice.\n\
         Use the provided context to personalize the reply and keep it concise.\n\
         Never invent dates, times, amounts, or policies that are not in the context.\n\
         If a detail is missing, say you will follow up with accurate information.\n\
         Sign the reply as \"{signature}\"."
    )
}

/// Message plus a capped summary of the context. Medical notes never leave the roster.
pub fn build_prompt(
    message: &InboundMessage,
    context: &AggregatedContext,
    config: &DraftingConfig,
    tz: Tz,
) -> String {
    let mut parts = Vec::new();

    let from = match &message.sender_name {
        Some(name) if !name.trim().is_empty() => format!("{} <{}>", name.trim(), message.sender),
        _ => message.sender.clone(),
    };
    parts.push("Draft a reply to the following email.".to_string());
    parts.push(format!("From: {}", from));
    parts.push(format!("Subject: {}", message.subject.trim()));
    parts.push(format!("Body:\n{}", clip(message.body.trim(), MAX_BODY_CHARS)));

    match &context.family {
        Some(family) => {
            parts.push("\n--- Family ---".to_string());
            if let Some(name) = &family.family_name {
                parts.push(format!("Family name: {}", name));
            }
            parts.push(format!("Primary contact: {}", family.primary_contact.name));
            for child in &family.children {
                match &child.team {
                    Some(team) => parts.push(format!("Child: {} ({})", child.name, team)),
                    None => parts.push(format!("Child: {}", child.name)),
                }
            }
            parts.push(format!("Payment status: {}", family.payment_status));
            if let Some(balance) = family.balance.filter(|b| *b > 0.0) {
                parts.push(format!("Outstanding balance: ${:.2}", balance));
            }
        }
        None => {
            parts.push("\n--- Family ---".to_string());
            parts.push(
                "The sender is not on the roster. Do not assume any enrollment, \
                 schedule, or payment details; ask who their child is if it matters."
                    .to_string(),
            );
        }
    }

    if !context.schedule.is_empty() {
        parts.push("\n--- Upcoming schedule ---".to_string());
        for entry in context.schedule.iter().take(config.max_schedule_entries) {
            parts.push(format_schedule_entry(entry, tz));
        }
    }

    if !context.knowledge.is_empty() {
        parts.push("\n--- Program knowledge ---".to_string());
        for hit in context.knowledge.iter().take(config.max_knowledge_items) {
            parts.push(format!(
                "- {}: {}",
                hit.title,
                clip(hit.content.trim(), MAX_KNOWLEDGE_CHARS)
            ));
        }
    }

    if !context.history.is_empty() {
        parts.push("\n--- Earlier in this conversation ---".to_string());
        let skip = context
            .history
            .len()
            .saturating_sub(config.max_history_turns);
        for turn in &context.history[skip..] {
            parts.push(format!(
                "- {}: {}",
                turn.sender,
                clip(turn.body.trim(), MAX_TURN_CHARS)
            ));
        }
    }

    parts.push("\n--- Instructions ---".to_string());
    parts.push("Answer the question directly using the details above.".to_string());
    if context.is_overdue() {
        parts.push(
            "The account is overdue. Do not discuss amounts beyond what is listed; \
             a staff member will confirm billing details."
                .to_string(),
        );
    }
    parts.push("Return only the email body.".to_string());

    parts.join("\n")
}

/// `- Practice for Johnny: Tuesday, March 3 at 6:00 PM @ North Field`
pub fn format_schedule_entry(entry: &ScheduleEntry, tz: Tz) -> String {
    let when = entry
        .starts_at
        .with_timezone(&tz)
        .format("%A, %B %-d at %-I:%M %p");
    let mut line = match &entry.child_name {
        Some(child) => format!("- {} for {}: {}", entry.title, child, when),
        None => format!("- {}: {}", entry.title, when),
    };
    if let Some(venue) = &entry.venue {
        line.push_str(" @ ");
        line.push_str(venue);
    }
    line
}

/// Truncate to `max_chars` characters, marking the cut.
pub fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationTurn, EventKind, KnowledgeCategory, KnowledgeHit};
    use chrono::{Duration, TimeZone, Utc};

    fn message() -> InboundMessage {
        InboundMessage {
            id: "m".into(),
            thread_id: Some("t".into()),
            sender: "someone@example.com".into(),
            sender_name: None,
            subject: "Fees".into(),
            body: "how much do I owe".into(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    fn hit(n: usize) -> KnowledgeHit {
        KnowledgeHit {
            id: format!("kb{n}"),
            title: format!("Item {n}"),
            content: "x".repeat(1_000),
            category: KnowledgeCategory::Faq,
            relevance_score: 0.5,
            similarity: 0.9,
        }
    }

    #[test]
    fn context_is_capped() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let context = AggregatedContext {
            knowledge: (0..5).map(hit).collect(),
            history: (0..8)
                .map(|i| ConversationTurn {
                    sender: "someone@example.com".into(),
                    body: format!("turn {i}"),
                    sent_at: start + Duration::minutes(i),
                })
                .collect(),
            ..AggregatedContext::default()
        };
        let prompt = build_prompt(&message(), &context, &DraftingConfig::default(), Tz::UTC);

        assert!(prompt.contains("Item 2"));
        assert!(!prompt.contains("Item 3"));
        assert!(!prompt.contains("turn 2"));
        assert!(prompt.contains("turn 3"));
        assert!(prompt.contains("turn 7"));
        assert!(!prompt.contains(&"x".repeat(MAX_KNOWLEDGE_CHARS + 1)));
    }

    #[test]
    fn unknown_sender_is_called_out() {
        let prompt = build_prompt(
            &message(),
            &AggregatedContext::default(),
            &DraftingConfig::default(),
            Tz::UTC,
        );
        assert!(prompt.contains("not on the roster"));
        assert!(prompt.contains("how much do I owe"));
    }

    #[test]
    fn schedule_renders_in_program_timezone() {
        let entry = ScheduleEntry {
            id: "s1".into(),
            family_id: "f".into(),
            child_name: Some("Johnny".into()),
            title: "Practice".into(),
            kind: EventKind::Practice,
            starts_at: Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap(),
            ends_at: None,
            venue: Some("North Field".into()),
            notes: None,
        };
        let line = format_schedule_entry(&entry, chrono_tz::America::Chicago);
        assert_eq!(line, "- Practice for Johnny: Tuesday, March 3 at 6:00 PM @ North Field");
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé...");
        assert_eq!(clip("short", 10), "short");
    }
}
