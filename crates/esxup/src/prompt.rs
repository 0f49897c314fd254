use std::io::Write;

use esxup_session::Interaction;

/// Terminal-backed operator interaction. Confirmations loop until the
/// operator answers `y` or `n`; secret prompts never echo.
pub struct TerminalPrompts;

impl TerminalPrompts {
    fn read_line(label: &str) -> String {
        print!("{label}: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return String::new();
        }
        line.trim().to_string()
    }
}

impl Interaction for TerminalPrompts {
    fn confirm(&self, question: &str) -> bool {
        loop {
            match Self::read_line(&format!("{question} [y,n]")).as_str() {
                "y" | "Y" => return true,
                "n" | "N" => return false,
                _ => {}
            }
        }
    }

    fn prompt(&self, label: &str) -> String {
        Self::read_line(label)
    }

    fn prompt_secret(&self, label: &str) -> String {
        match rpassword::prompt_password(format!("{label}: ")) {
            Ok(value) => value.trim().to_string(),
            Err(_) => String::new(),
        }
    }
}
