use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static BELL: Emoji<'_, '_> = Emoji("🔔 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

enum GuideLine {
    Status(String, String),
    Command(String, String),
    Text(String),
    Hint(String, String),
    Blank,
}

/// A titled block of output, built up line by line and printed at once.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    /// An example command line, with an optional note after it.
    pub fn hint(mut self, command: &str, note: &str) -> Self {
        self.lines
            .push(GuideLine::Hint(command.to_string(), note.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Plain-text rendering, one string per output line.
    pub fn render(&self) -> Vec<String> {
        let width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                GuideLine::Status(label, _) | GuideLine::Command(label, _) => {
                    Some(label.chars().count())
                }
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let mut out = vec![format!("{}", style(&self.title).bold().underlined())];
        for line in &self.lines {
            out.push(match line {
                GuideLine::Status(label, value) => format!(
                    "  {} {}",
                    style(format!("{:<width$}", label, width = width)).bold().cyan(),
                    value
                ),
                GuideLine::Command(name, description) => format!(
                    "  {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    style(description).dim()
                ),
                GuideLine::Text(text) => format!("  {}", text),
                GuideLine::Hint(command, note) if note.is_empty() => {
                    format!("  {} {}", style("$").dim(), style(command).cyan())
                }
                GuideLine::Hint(command, note) => format!(
                    "  {} {}  {}",
                    style("$").dim(),
                    style(command).cyan(),
                    style(note).dim()
                ),
                GuideLine::Blank => String::new(),
            });
        }
        out
    }

    pub fn print(&self) {
        println!();
        for line in self.render() {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_padded_to_the_widest() {
        console::set_colors_enabled(false);
        let lines = GuideSection::new("Apps")
            .status("id", "digest")
            .status("status", "active")
            .blank()
            .text("done")
            .render();
        assert_eq!(
            lines,
            vec!["Apps", "  id     digest", "  status active", "", "  done"]
        );
    }

    #[test]
    fn empty_section_has_only_a_title() {
        let section = GuideSection::new("Nothing");
        assert!(section.is_empty());
        assert_eq!(section.render().len(), 1);
    }
}
