//! Message text for the transcript and its terminal rendering.
//!
//! Content may carry `**bold**` markers; they are resolved only when a
//! message is printed.

use crate::api::events::ProgressStep;
use crate::files::format_file_size;
use crate::transcript::{Attachment, FailureKind, Message, MessageStatus, Role};

pub const PLACEHOLDER_CONTENT: &str = "Uploading document, waiting for the service...";
pub const DEFAULT_SERVER_ERROR: &str = "the service could not process this document";

fn status_badge(status: &str) -> String {
    match status.trim().to_lowercase().as_str() {
        "" => String::new(),
        "in-progress" | "in_progress" | "running" | "进行中" => "[in progress]".into(),
        "done" | "completed" | "完成" => "[done]".into(),
        "failed" | "error" | "失败" => "[failed]".into(),
        other => format!("[{}]", other),
    }
}

/// Summary of the latest progress step. Replaces, never extends, the previous one.
pub fn progress_content(step: &ProgressStep) -> String {
    let mut content = format!("**Step {}: {}**", step.step, step.action.trim());
    let badge = status_badge(&step.status);
    if !badge.is_empty() {
        content.push(' ');
        content.push_str(&badge);
    }
    if !step.message.trim().is_empty() {
        content.push('\n');
        content.push_str(step.message.trim());
    }
    content
}

pub fn completion_content(attachment: &Attachment) -> String {
    let name = attachment
        .source
        .as_ref()
        .map(|s| s.original_name.as_str())
        .unwrap_or("document");
    let mut content = format!(
        "**Processing complete** for {}: found {} sensitive entities",
        name,
        attachment.entity_count()
    );
    if !attachment.entity_statistics.is_empty() {
        let stats: Vec<String> = attachment
            .entity_statistics
            .iter()
            .map(|(kind, count)| format!("{} {}", kind, count))
            .collect();
        content.push_str(&format!(" ({})", stats.join(", ")));
    }
    content
}

pub fn failure_content(kind: FailureKind, detail: Option<&str>) -> String {
    let detail = detail.map(str::trim).filter(|d| !d.is_empty());
    match kind {
        FailureKind::Validation => format!(
            "**Cannot upload:** {}",
            detail.unwrap_or("only PDF and Word documents are supported")
        ),
        FailureKind::Transport => {
            format!("**Upload failed:** {}", detail.unwrap_or("connection error"))
        }
        FailureKind::Server => format!(
            "**Processing failed:** {}",
            detail.unwrap_or(DEFAULT_SERVER_ERROR)
        ),
        FailureKind::NoResult => {
            "**Processing failed:** no valid result was received from the service".into()
        }
        FailureKind::Cancelled => "**Upload cancelled** before the service finished".into(),
        FailureKind::IdleTimeout => format!(
            "**Upload stalled:** no data from the service for {}",
            detail.unwrap_or("too long")
        ),
    }
}

pub fn strip_markup(text: &str) -> String {
    text.replace("**", "")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Print the document text carried by an attachment.
    pub show_text: bool,
    /// Print the unmasked original rather than the masked text.
    pub show_original: bool,
}

fn render_attachment(out: &mut String, attachment: &Attachment, options: RenderOptions) {
    if let Some(source) = &attachment.source {
        out.push_str(&format!(
            "\n  file: {} ({}, {})",
            source.original_name,
            format_file_size(source.size),
            source.content_type
        ));
    }
    for (kind, count) in &attachment.entity_statistics {
        out.push_str(&format!("\n  {:<12} {}", kind, count));
    }
    if let Some(name) = attachment
        .export
        .as_ref()
        .and_then(|e| e.export_filename.as_deref())
    {
        out.push_str(&format!("\n  export: {}", name));
    }
    if options.show_text {
        let (label, text) = if options.show_original {
            ("original", &attachment.original_text)
        } else {
            ("masked", &attachment.masked_text)
        };
        out.push_str(&format!("\n  --- {} text ---\n{}", label, text));
    }
}

pub fn render_message(message: &Message, options: RenderOptions) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "desk",
    };
    let marker = match message.status {
        MessageStatus::Pending => " …",
        MessageStatus::Completed => "",
        MessageStatus::Failed(_) => " !",
    };

    let mut out = format!("{}{}> {}", speaker, marker, strip_markup(&message.content));
    if let Some(attachment) = &message.attachment {
        render_attachment(&mut out, attachment, options);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::events::{Entity, FileInfo};
    use std::collections::BTreeMap;

    fn idcard(start: usize) -> Entity {
        Entity {
            start,
            end: start + 18,
            entity_type: "IDCARD".into(),
            original: "110101199003078765".into(),
        }
    }

    #[test]
    fn test_progress_content_shows_only_this_step() {
        let step = ProgressStep {
            step: 2,
            action: "detecting entities".into(),
            status: "done".into(),
            message: "2 found".into(),
        };
        assert_eq!(
            progress_content(&step),
            "**Step 2: detecting entities** [done]\n2 found"
        );
    }

    #[test]
    fn test_completion_mentions_count_and_types() {
        let attachment = Attachment {
            original_text: String::new(),
            masked_text: String::new(),
            entities: vec![idcard(0), idcard(40)],
            entity_statistics: BTreeMap::from([("IDCARD".to_string(), 2)]),
            source: Some(FileInfo {
                original_name: "case.pdf".into(),
                size: 1024,
                content_type: "application/pdf".into(),
                file_id: None,
            }),
            export: None,
        };
        let content = completion_content(&attachment);
        assert!(content.contains("case.pdf"));
        assert!(content.contains("found 2 sensitive entities"));
        assert!(content.contains("IDCARD 2"));
    }

    #[test]
    fn test_server_failure_falls_back_to_default() {
        assert_eq!(
            failure_content(FailureKind::Server, Some("  ")),
            format!("**Processing failed:** {}", DEFAULT_SERVER_ERROR)
        );
        assert_eq!(
            failure_content(FailureKind::Server, Some("bad scan")),
            "**Processing failed:** bad scan"
        );
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(strip_markup("**Step 1: parse** [done]"), "Step 1: parse [done]");
    }
}
