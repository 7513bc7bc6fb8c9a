//! Restore decisions taken from command-line flags or terminal prompts.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use codictate_backup::{
    BackupError, KeepChoice, PreflightReport, RecoverableChoice, RestoreDecider, SafetyBackup,
    SafetyFallback, format_bytes,
};

/// Line-based question/answer channel.
pub struct Prompter {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Prompter {
    pub fn new(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    /// Prompt on stderr when both stdin and stderr are terminals.
    pub fn stdio() -> Option<Self> {
        (io::stdin().is_terminal() && io::stderr().is_terminal())
            .then(|| Self::new(io::BufReader::new(io::stdin()), io::stderr()))
    }

    pub fn say(&self, text: &str) {
        let _ = writeln!(self.output.lock(), "{text}");
    }

    /// Ask until one of `choices` is typed; EOF or an empty answer picks
    /// `default`.
    pub fn choose(&self, question: &str, choices: &[(char, &str)], default: char) -> char {
        let options: Vec<String> = choices
            .iter()
            .map(|(key, label)| {
                if *key == default {
                    format!("[{}] {label}", key.to_ascii_uppercase())
                } else {
                    format!("[{key}] {label}")
                }
            })
            .collect();
        loop {
            self.say(&format!("{question} {}", options.join(" / ")));
            let Some(answer) = self.read_line() else {
                return default;
            };
            let Some(first) = answer.chars().next() else {
                return default;
            };
            let first = first.to_ascii_lowercase();
            if choices.iter().any(|(key, _)| *key == first) {
                return first;
            }
        }
    }

    /// Yes/no question defaulting to no.
    pub fn confirm(&self, question: &str) -> bool {
        self.choose(question, &[('y', "yes"), ('n', "no")], 'n') == 'y'
    }

    fn read_line(&self) -> Option<String> {
        {
            let mut out = self.output.lock();
            let _ = write!(out, "> ");
            let _ = out.flush();
        }
        let mut line = String::new();
        match self.input.lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

/// How to answer when the safety backup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    Ask,
    Lightweight,
    Cancel,
}

/// [`RestoreDecider`] driven by flags, prompting for anything left open.
///
/// Without a prompter every open question gets the conservative answer.
pub struct CliDecider {
    pub accept_partial: bool,
    pub raise_limits: bool,
    pub fallback: FallbackMode,
    pub discard_after: bool,
    pub assume_yes: bool,
    pub prompter: Option<Prompter>,
    declined_fallback: AtomicBool,
}

impl CliDecider {
    /// Conservative answers everywhere; adjust the public fields from flags.
    pub fn new(prompter: Option<Prompter>) -> Self {
        Self {
            accept_partial: false,
            raise_limits: false,
            fallback: FallbackMode::Ask,
            discard_after: false,
            assume_yes: false,
            prompter,
            declined_fallback: AtomicBool::new(false),
        }
    }

    /// Whether a failed safety backup was answered with cancel.
    pub fn declined_fallback(&self) -> bool {
        self.declined_fallback.load(Ordering::SeqCst)
    }

    fn describe(report: &PreflightReport) -> Vec<String> {
        let mut lines: Vec<String> = report
            .recoverable()
            .map(|e| format!("  - {}", e.user_message()))
            .collect();
        if report.skipped_rows > 0 {
            lines.push(format!(
                "  {} of {} history rows cannot be restored.",
                report.skipped_rows, report.history_rows
            ));
        }
        lines
    }

    fn fallback_choice(&self, error: &BackupError, attempt: u32) -> SafetyFallback {
        match self.fallback {
            FallbackMode::Lightweight => return SafetyFallback::Lightweight,
            FallbackMode::Cancel => return SafetyFallback::Cancel,
            FallbackMode::Ask => {}
        }
        let Some(prompter) = &self.prompter else {
            return SafetyFallback::Cancel;
        };
        prompter.say(&format!(
            "Safety backup attempt {attempt} failed: {}",
            error.user_message()
        ));
        if let Some(suggestion) = error.suggestion() {
            prompter.say(&suggestion);
        }
        prompter.say("A lightweight safety backup leaves out recordings; they cannot be rolled back.");
        match prompter.choose(
            "How do you want to proceed?",
            &[('r', "retry"), ('l', "lightweight"), ('n', "cancel")],
            'n',
        ) {
            'r' => SafetyFallback::RetryFull,
            'l' => SafetyFallback::Lightweight,
            _ => SafetyFallback::Cancel,
        }
    }
}

impl RestoreDecider for CliDecider {
    fn confirm_recoverable(&self, report: &PreflightReport) -> RecoverableChoice {
        if self.accept_partial {
            return RecoverableChoice::ContinuePartial;
        }
        if self.raise_limits {
            return RecoverableChoice::RaiseLimits;
        }
        let Some(prompter) = &self.prompter else {
            return RecoverableChoice::Cancel;
        };
        prompter.say("The archive can be restored, but:");
        for line in Self::describe(report) {
            prompter.say(&line);
        }
        let mut choices = vec![('c', "continue"), ('n', "cancel")];
        if report.exceeds_soft_limits() {
            choices.insert(1, ('r', "raise limits"));
        }
        match prompter.choose("Continue?", &choices, 'n') {
            'c' => RecoverableChoice::ContinuePartial,
            'r' => RecoverableChoice::RaiseLimits,
            _ => RecoverableChoice::Cancel,
        }
    }

    fn on_safety_backup_failed(&self, error: &BackupError, attempt: u32) -> SafetyFallback {
        let choice = self.fallback_choice(error, attempt);
        if choice == SafetyFallback::Cancel {
            self.declined_fallback.store(true, Ordering::SeqCst);
        }
        choice
    }

    fn keep_safety_backup(&self, _backup: &SafetyBackup) -> KeepChoice {
        if self.discard_after {
            KeepChoice::Discard
        } else {
            KeepChoice::Keep
        }
    }

    fn confirm_discard(&self, backup: &SafetyBackup) -> bool {
        if self.assume_yes {
            return true;
        }
        self.prompter.as_ref().is_some_and(|prompter| {
            prompter.confirm(&format!(
                "Delete safety backup {} ({})? It cannot be recovered.",
                backup.file_name,
                format_bytes(backup.size_bytes)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn prompter(answers: &str) -> Prompter {
        Prompter::new(Cursor::new(answers.to_string().into_bytes()), io::sink())
    }

    fn decider(prompter: Option<Prompter>) -> CliDecider {
        CliDecider::new(prompter)
    }

    #[test]
    fn test_choose_retries_until_valid() {
        let p = prompter("x\nmaybe\nL\n");
        assert_eq!(p.choose("?", &[('r', "retry"), ('l', "light")], 'r'), 'l');
    }

    #[test]
    fn test_choose_eof_and_empty_pick_default() {
        assert_eq!(prompter("").choose("?", &[('y', "yes"), ('n', "no")], 'n'), 'n');
        assert_eq!(prompter("\n").choose("?", &[('y', "yes"), ('n', "no")], 'y'), 'y');
        assert!(prompter("yes\n").confirm("?"));
        assert!(!prompter("").confirm("?"));
    }

    #[test]
    fn test_non_interactive_answers_are_conservative() {
        let d = decider(None);
        let error = BackupError::Declined {
            reason: "test".into(),
        };
        assert!(!d.declined_fallback());
        assert_eq!(d.on_safety_backup_failed(&error, 2), SafetyFallback::Cancel);
        assert!(d.declined_fallback());
        let backup = SafetyBackup {
            file_name: "safety.zip".into(),
            created_at: chrono::Utc::now(),
            scope: codictate_backup::Scope::Full,
            size_bytes: 10,
            user_saved: false,
            session_id: None,
        };
        assert!(!d.confirm_discard(&backup));
        assert_eq!(d.keep_safety_backup(&backup), KeepChoice::Keep);
    }

    #[test]
    fn test_flags_override_prompts() {
        let mut d = decider(Some(prompter("n\n")));
        d.fallback = FallbackMode::Lightweight;
        let error = BackupError::Declined {
            reason: "test".into(),
        };
        assert_eq!(d.on_safety_backup_failed(&error, 2), SafetyFallback::Lightweight);

        let mut d = decider(Some(prompter("l\n")));
        assert_eq!(d.on_safety_backup_failed(&error, 2), SafetyFallback::Lightweight);
        assert!(!d.declined_fallback());
        d.fallback = FallbackMode::Cancel;
        assert_eq!(d.on_safety_backup_failed(&error, 3), SafetyFallback::Cancel);
        assert!(d.declined_fallback());
    }

    #[test]
    fn test_prompted_retry_is_not_a_decline() {
        let d = decider(Some(prompter("r
n
")));
        let error = BackupError::Declined {
            reason: "test".into(),
        };
        assert_eq!(d.on_safety_backup_failed(&error, 1), SafetyFallback::RetryFull);
        assert!(!d.declined_fallback());
        assert_eq!(d.on_safety_backup_failed(&error, 2), SafetyFallback::Cancel);
        assert!(d.declined_fallback());
    }
}
