//! CLI front end (§6 "host API"), analogous to the teacher's `just-bash`
//! binary: resolve a script from `-c`, a file, or stdin, run it through an
//! `Engine`, and print the result.

use clap::Parser;
use std::io::Read;

use pawscript::{Engine, EngineOptions, ExecOptions, Outcome};

#[derive(Parser)]
#[command(name = "pawscript")]
#[command(about = "An embeddable shell-style scripting engine")]
#[command(version)]
struct Cli {
    /// Execute the script from a command line argument
    #[arg(short = 'c')]
    script: Option<String>,

    /// Enable debug-level logging
    #[arg(long = "debug")]
    debug: bool,

    /// Output the result as JSON
    #[arg(long = "json")]
    json: bool,

    /// Script file to execute
    #[arg()]
    script_file: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    pawscript::log_surface::init_tracing(cli.debug);

    let script = if let Some(s) = cli.script {
        s
    } else if let Some(ref file) = cli.script_file {
        match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error: cannot read script file: {file}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        use std::io::IsTerminal;
        if std::io::stdin().is_terminal() {
            eprintln!("Error: no script provided. Use -c 'script', a script file, or pipe via stdin.");
            std::process::exit(1);
        }
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).unwrap_or_default();
        buf
    };

    let engine = Engine::new(EngineOptions { debug: cli.debug, enable_macros: true, ..Default::default() });
    engine.register_standard_library(Vec::new());

    let result = engine.execute(&script, ExecOptions::default()).await;

    let (status, value) = match result {
        Ok(Outcome::Status(status)) => (status, None),
        Ok(Outcome::Value(v)) => (true, Some(v.stringify())),
        Ok(Outcome::Token(_)) => {
            eprintln!("Error: script suspended on a token with no host driving resumption");
            std::process::exit(1);
        }
        Err(e) => {
            if cli.json {
                println!("{}", serde_json::json!({"error": e.to_string(), "status": false}));
            } else {
                eprintln!("Error: {e}");
            }
            std::process::exit(1);
        }
    };

    if cli.json {
        println!("{}", serde_json::json!({"status": status, "value": value}));
    } else if let Some(v) = value {
        println!("{v}");
    }

    std::process::exit(if status { 0 } else { 1 });
}
