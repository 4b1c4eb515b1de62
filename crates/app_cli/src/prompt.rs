use std::fmt::Display;
use std::io::{BufRead, Write};

use anyhow::{Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// Line-oriented terminal prompts over any reader/writer pair.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn say(&mut self, text: impl Display) -> Result<()> {
        writeln!(self.output, "{text}")?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            bail!("input closed");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Free text. Enter keeps `current`.
    pub fn ask(&mut self, label: &str, current: &str) -> Result<String> {
        if current.is_empty() {
            write!(self.output, "{label}: ")?;
        } else {
            write!(self.output, "{label} [{current}]: ")?;
        }
        let line = self.read_line()?;
        Ok(if line.trim().is_empty() {
            current.to_string()
        } else {
            line.trim().to_string()
        })
    }

    /// Pick from a numbered list with a blank first entry, or type a value
    /// that is not listed yet. Numbers past the list are taken as typed.
    pub fn choose(&mut self, label: &str, options: &[String], current: &str) -> Result<String> {
        writeln!(self.output, "{label}:")?;
        writeln!(self.output, "  0) (blank)")?;
        for (index, option) in options.iter().enumerate() {
            writeln!(self.output, "  {}) {option}", index + 1)?;
        }
        let line = self.ask("number or new value", current)?;
        Ok(match line.parse::<usize>() {
            Ok(0) => String::new(),
            Ok(n) if n <= options.len() => options[n - 1].clone(),
            _ => line,
        })
    }

    pub fn decide(&mut self, question: &str) -> Result<Decision> {
        loop {
            write!(self.output, "{question} [y]es / [c]ancel: ")?;
            match self.read_line()?.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(Decision::Confirm),
                "c" | "cancel" | "n" | "no" => return Ok(Decision::Cancel),
                _ => writeln!(self.output, "please answer y or c")?,
            }
        }
    }
}
