//! Instance bootstrap scripts.

use crate::error::{SynthError, SynthResult};
use crate::template::Expr;

const SHEBANG: &str = "#!/bin/bash";

/// Shell commands run once at first boot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    commands: Vec<String>,
}

impl UserData {
    pub fn for_linux() -> Self {
        Self::default()
    }

    pub fn add_commands<I, S>(&mut self, commands: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Write `content` to `path` through a quoted heredoc, then chmod it.
    ///
    /// The delimiter is quoted so the shell does not expand `$` in the file.
    pub fn add_file(&mut self, path: &str, content: &str, mode: &str) -> SynthResult<&mut Self> {
        if path.is_empty() || path.contains(char::is_whitespace) {
            return Err(SynthError::property(
                "UserData",
                format!("file path '{}' must be non-empty without whitespace", path),
            ));
        }
        let delimiter = heredoc_delimiter(path);
        if content.lines().any(|line| line.trim() == delimiter) {
            return Err(SynthError::property(
                "UserData",
                format!("content of '{}' contains the heredoc delimiter", path),
            ));
        }
        self.commands.push(format!("cat <<'{}' > {}", delimiter, path));
        self.commands.push(content.trim_end_matches('\n').to_string());
        self.commands.push(delimiter);
        self.commands.push(format!("chmod {} {}", mode, path));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn render(&self) -> String {
        let mut script = String::from(SHEBANG);
        for command in &self.commands {
            script.push('\n');
            script.push_str(command);
        }
        script
    }

    /// `Fn::Base64` of the rendered script, the form EC2 expects
    pub fn to_expr(&self) -> Expr {
        Expr::base64(Expr::str(self.render()))
    }
}

fn heredoc_delimiter(path: &str) -> String {
    let stem: String = path
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    format!("EOF_{}", stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_starts_with_shebang() {
        let mut data = UserData::for_linux();
        data.add_commands(["yum update -y", "service docker start"]);
        assert_eq!(data.render(), "#!/bin/bash\nyum update -y\nservice docker start");
    }

    #[test]
    fn test_add_file_uses_quoted_heredoc() {
        let mut data = UserData::for_linux();
        data.add_file("/home/ec2-user/setup.sh", "echo $HOME\n", "+x")
            .unwrap();
        let script = data.render();
        assert!(script.contains("cat <<'EOF_SETUPSH' > /home/ec2-user/setup.sh\necho $HOME\nEOF_SETUPSH"));
        assert!(script.ends_with("chmod +x /home/ec2-user/setup.sh"));
    }

    #[test]
    fn test_add_file_rejects_delimiter_in_content() {
        let mut data = UserData::for_linux();
        assert!(data.add_file("/tmp/a.sh", "x\nEOF_ASH\ny", "+x").is_err());
        assert!(data.add_file("/tmp/my file", "x", "+x").is_err());
    }

    #[test]
    fn test_to_expr_is_base64() {
        let data = UserData::for_linux();
        assert_eq!(data.to_expr().to_json(), json!({ "Fn::Base64": "#!/bin/bash" }));
    }
}
