//! Interactive REPL.

use crate::commands::Session;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

pub fn run(mut session: Session) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "rstchart REPL".bold().cyan());
    println!(
        "Loaded {} at t = {}",
        session.interpreter().model().to_string().cyan(),
        session.interpreter().time()
    );
    println!(
        "{}",
        format!("[{}]", session.interpreter().active_leaves().join(", ")).yellow()
    );

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".rstchart_history"))
        .unwrap_or_else(|_| ".rstchart_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "rstchart>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match session.execute(line) {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    println!("{}", "Bye.".dimmed());

    Ok(())
}
