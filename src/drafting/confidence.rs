//! Draft confidence, tone, and reviewer hints

use crate::models::{AggregatedContext, Tone};

use super::FinishReason;

const BASE: f32 = 0.45;
const MAX_COUNTED_HITS: usize = 5;

/// Weighted share of the context that was actually available, in [0, 1].
pub fn completeness(context: &AggregatedContext) -> f32 {
    let mut score = 0.0;
    if context.family.is_some() {
        score += 0.4;
        // Payment status travels on the family record
        score += 0.1;
    }
    if !context.schedule.is_empty() {
        score += 0.2;
    }
    score += context.knowledge.len().min(MAX_COUNTED_HITS) as f32 * 0.04;
    if !context.history.is_empty() {
        score += 0.1;
    }
    score
}

/// Confidence in a draft built from `context`. Sparse context always scores lower.
pub fn score(context: &AggregatedContext, finish: FinishReason) -> f32 {
    let mut confidence = BASE + completeness(context) * 0.3;
    if context.family.is_some() {
        confidence += 0.1;
    }
    if !context.history.is_empty() {
        confidence += 0.05;
    }
    confidence += (context.knowledge.len() as f32 * 0.02).min(0.1);
    confidence += match finish {
        FinishReason::Complete => 0.05,
        FinishReason::Truncated => -0.1,
        FinishReason::Other => 0.0,
    };
    confidence.clamp(0.0, 1.0)
}

pub fn detect_tone(body: &str) -> Tone {
    let lower = body.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(&["unfortunately", "apologize", "sorry", "regret"]) {
        Tone::Apologetic
    } else if any(&["excited", "delighted", "pleased", "happy"]) {
        Tone::Enthusiastic
    } else if any(&["urgent", "immediately", "asap", "critical"]) {
        Tone::Urgent
    } else if any(&["thank", "appreciate", "grateful"]) {
        Tone::Appreciative
    } else {
        Tone::Professional
    }
}

pub fn suggest_edits(body: &str, confidence: f32, context: &AggregatedContext) -> Vec<String> {
    let mut edits = Vec::new();
    if confidence < 0.6 {
        edits.push("Review all details for accuracy".to_string());
        edits.push("Consider adding more personalization".to_string());
    }
    if context.family.is_none() {
        edits.push("Verify who the sender is before replying".to_string());
    }
    if context.schedule.is_empty() {
        edits.push("Check whether schedule details should be included".to_string());
    }
    if context.is_overdue() {
        edits.push("Confirm the outstanding balance with billing before sending".to_string());
    }

    let length = body.chars().count();
    if length > 500 {
        edits.push("Consider shortening for clarity".to_string());
    } else if length < 100 {
        edits.push("Consider adding more detail".to_string());
    }
    if body.contains('[') || body.contains(']') {
        edits.push("Fill in placeholder text".to_string());
    }
    edits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Contact, ConversationTurn, EventKind, FamilyRecord, KnowledgeCategory, KnowledgeHit,
        PaymentStatus, ScheduleEntry,
    };
    use chrono::{TimeZone, Utc};

    fn family() -> FamilyRecord {
        FamilyRecord {
            family_id: "rec1".into(),
            family_name: None,
            primary_contact: Contact {
                name: "Pat".into(),
                email: "parent@example.com".into(),
                phone: None,
            },
            secondary_contact: None,
            children: Vec::new(),
            payment_status: PaymentStatus::Current,
            balance: None,
            notes: String::new(),
        }
    }

    fn hit() -> KnowledgeHit {
        KnowledgeHit {
            id: "kb".into(),
            title: "Practice policy".into(),
            content: "Practices are Tuesdays.".into(),
            category: KnowledgeCategory::ScheduleManagement,
            relevance_score: 0.8,
            similarity: 0.82,
        }
    }

    fn practice() -> ScheduleEntry {
        ScheduleEntry {
            id: "s1".into(),
            family_id: "rec1".into(),
            child_name: Some("Johnny".into()),
            title: "Practice".into(),
            kind: EventKind::Practice,
            starts_at: Utc.with_ymd_and_hms(2026, 3, 3, 18, 0, 0).unwrap(),
            ends_at: None,
            venue: None,
            notes: None,
        }
    }

    #[test]
    fn family_schedule_and_one_hit_clear_the_gate() {
        let context = AggregatedContext {
            family: Some(family()),
            schedule: vec![practice()],
            knowledge: vec![hit()],
            ..AggregatedContext::default()
        };
        let confidence = score(&context, FinishReason::Complete);
        assert!(confidence >= 0.8, "got {confidence}");
    }

    #[test]
    fn unknown_sender_scores_lower_than_known() {
        let known = AggregatedContext {
            family: Some(family()),
            knowledge: vec![hit()],
            ..AggregatedContext::default()
        };
        let unknown = AggregatedContext {
            family: None,
            ..known.clone()
        };
        let known_score = score(&known, FinishReason::Complete);
        let unknown_score = score(&unknown, FinishReason::Complete);
        assert!(unknown_score < known_score);
        assert!(unknown_score < 0.8);
    }

    #[test]
    fn empty_context_is_low_and_truncation_penalized() {
        let empty = AggregatedContext::default();
        assert!(score(&empty, FinishReason::Complete) < 0.6);
        assert!(score(&empty, FinishReason::Truncated) < score(&empty, FinishReason::Other));
    }

    #[test]
    fn full_context_is_clamped() {
        let context = AggregatedContext {
            family: Some(family()),
            schedule: vec![practice()],
            knowledge: vec![hit(); 8],
            history: vec![ConversationTurn {
                sender: "parent@example.com".into(),
                body: "hi".into(),
                sent_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            }],
            ..AggregatedContext::default()
        };
        assert_eq!(score(&context, FinishReason::Complete), 1.0);
    }

    #[test]
    fn tone_follows_first_matching_keyword_group() {
        assert_eq!(detect_tone("Sorry, we're thrilled and happy"), Tone::Apologetic);
        assert_eq!(detect_tone("We're delighted to have Johnny"), Tone::Enthusiastic);
        assert_eq!(detect_tone("Please reply ASAP"), Tone::Urgent);
        assert_eq!(detect_tone("Thank you for asking"), Tone::Appreciative);
        assert_eq!(detect_tone("Practice is at 6."), Tone::Professional);
    }

    #[test]
    fn edits_flag_missing_context_and_placeholders() {
        let edits = suggest_edits("See you at [TIME].", 0.5, &AggregatedContext::default());
        assert!(edits.iter().any(|e| e.contains("accuracy")));
        assert!(edits.iter().any(|e| e.contains("sender")));
        assert!(edits.iter().any(|e| e.contains("schedule")));
        assert!(edits.iter().any(|e| e.contains("placeholder")));
    }
}
