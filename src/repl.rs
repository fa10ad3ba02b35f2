// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the Moss programming language.
// Provides an interactive shell with command history, multi-line input that
// waits for balanced delimiters, and a few ':' commands. One VM lives for
// the whole session, so globals persist between lines.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

/// REPL session holding the persistent VM and the line editor.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        let banner = format!("Moss {} - interactive shell", env!("CARGO_PKG_VERSION"));
        println!("{}", banner.as_str().bright_cyan());
        println!(
            "  Type {} for commands or {} to leave.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "moss> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        }
                        break;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.vm.interpret(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input discarded, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{}: {}", "readline error".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handles a ':' command; returns false when the session should end.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":quit" | ":q" => false,
            ":help" => {
                println!("  {}     show this help", ":help".bright_yellow());
                println!("  {}  list defined globals", ":globals".bright_yellow());
                println!("  {}     leave the shell", ":quit".bright_yellow());
                true
            }
            ":globals" => {
                for name in self.vm.global_names() {
                    println!("  {}", name);
                }
                true
            }
            _ => {
                println!("Unknown command {}. Try {}.", command, ":help".bright_yellow());
                true
            }
        }
    }
}

/// Input is complete once parentheses and braces balance outside strings.
fn is_input_complete(buffer: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    for c in buffer.chars() {
        match c {
            '"' => in_string = !in_string,
            '(' | '{' if !in_string => depth += 1,
            ')' | '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    !in_string && depth <= 0
}
