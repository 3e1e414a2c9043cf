use serde::{Deserialize, Serialize};

/// Verbs the bot accepts in MR comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandVerb {
    /// Force immediate re-evaluation.
    Process,
    /// Force a pipeline trigger on the next plan.
    RunPipeline,
    /// Post-merge only: regenerate follow-ups.
    FollowUp,
    /// Pre-merge: switch follow-up mode to draft; post-merge: regenerate
    /// follow-ups in draft mode.
    DraftFollowUp,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::RunPipeline => "run-pipeline",
            Self::FollowUp => "follow-up",
            Self::DraftFollowUp => "draft-follow-up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommand {
    pub verb: CommandVerb,
    pub args: Vec<String>,
}

/// Parse a comment into a bot command. A comment is a command iff its
/// first line is `@<bot-handle> <verb> [args]`. Unknown verbs are ignored
/// silently (None).
pub fn parse_command(bot_handle: &str, comment: &str) -> Option<BotCommand> {
    let first_line = comment.lines().next()?.trim();
    let mut words = first_line.split_whitespace();
    let mention = words.next()?;
    if mention != format!("@{bot_handle}") {
        return None;
    }
    let verb = match words.next()? {
        "process" => CommandVerb::Process,
        "run-pipeline" => CommandVerb::RunPipeline,
        "follow-up" => CommandVerb::FollowUp,
        "draft-follow-up" => CommandVerb::DraftFollowUp,
        _ => return None,
    };
    Some(BotCommand { verb, args: words.map(str::to_string).collect() })
}
