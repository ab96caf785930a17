//! Modal terminal menus.

use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::command;

pub const BACKTITLE: &str = "Proxmox VE VM provisioning";

/// One row of a radio list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    /// Value returned when the row is chosen.
    pub tag: String,
    pub label: String,
    pub selected: bool,
}

/// Result of a list prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Chosen(String),
    /// Confirmed with no row selected.
    Nothing,
    Cancelled,
}

pub trait Menu {
    /// `Some(answer)`, or `None` if the dialog was cancelled.
    fn yes_no(&mut self, title: &str, text: &str) -> Result<Option<bool>>;

    fn radiolist(&mut self, title: &str, text: &str, items: &[MenuItem]) -> Result<Selection>;
}

/// Width that fits the longest label plus tag and widget chrome.
pub fn list_width(items: &[MenuItem], title: &str) -> usize {
    const CHROME: usize = 16;
    let widest = items
        .iter()
        .map(|i| i.tag.chars().count() + i.label.chars().count())
        .max()
        .unwrap_or(0);
    (widest + CHROME).max(title.chars().count() + 8).clamp(40, 120)
}

/// [`Menu`] rendered by `whiptail`.
pub struct Whiptail;

const EXIT_CANCEL: i32 = 1;
const EXIT_ESC: i32 = 255;

impl Whiptail {
    /// Run whiptail with the terminal on stdin/stdout; the answer is
    /// written to stderr.
    fn run(args: &[String]) -> Result<(Option<i32>, String)> {
        let mut cmd = Command::new("whiptail");
        cmd.arg("--backtitle").arg(BACKTITLE).args(args);
        tracing::debug!("exec: {}", command::display(&cmd));
        let output = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .context("failed to run whiptail")?;
        let answer = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status.code(), answer))
    }
}

impl Menu for Whiptail {
    fn yes_no(&mut self, title: &str, text: &str) -> Result<Option<bool>> {
        let args = vec![
            "--title".to_string(),
            title.to_string(),
            "--yesno".to_string(),
            text.to_string(),
            "10".to_string(),
            "58".to_string(),
        ];
        match Self::run(&args)?.0 {
            Some(0) => Ok(Some(true)),
            Some(EXIT_CANCEL) => Ok(Some(false)),
            Some(EXIT_ESC) | None => Ok(None),
            Some(code) => bail!("whiptail exited with status {code}"),
        }
    }

    fn radiolist(&mut self, title: &str, text: &str, items: &[MenuItem]) -> Result<Selection> {
        let width = list_width(items, title);
        let mut args = vec![
            "--title".to_string(),
            title.to_string(),
            "--radiolist".to_string(),
            text.to_string(),
            (items.len() + 8).min(20).to_string(),
            width.to_string(),
            items.len().min(10).to_string(),
        ];
        for item in items {
            args.push(item.tag.clone());
            args.push(item.label.clone());
            args.push(if item.selected { "ON" } else { "OFF" }.to_string());
        }
        match Self::run(&args)? {
            (Some(0), answer) if answer.is_empty() => Ok(Selection::Nothing),
            (Some(0), answer) => Ok(Selection::Chosen(answer.trim_matches('"').to_string())),
            (Some(EXIT_CANCEL) | Some(EXIT_ESC) | None, _) => Ok(Selection::Cancelled),
            (Some(code), _) => bail!("whiptail exited with status {code}"),
        }
    }
}
