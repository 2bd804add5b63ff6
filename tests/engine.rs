//! End-to-end scenarios (§8): drive a full `Engine` through `execute`,
//! asserting on a `MemorySink` instead of real stdout.

use std::sync::Arc;
use std::time::Duration;

use pawscript::stdlib::core_commands::{EchoCommand, FalseCommand, MemorySink, TrueCommand};
use pawscript::{Engine, EngineOptions, ExecOptions, Outcome};

fn engine_with_sink() -> (Engine, Arc<MemorySink>) {
    let engine = Engine::new(EngineOptions { enable_macros: true, ..Default::default() });
    let sink = Arc::new(MemorySink::new());
    engine.register_command("echo", Arc::new(EchoCommand::new(sink.clone())));
    engine.register_command("true", Arc::new(TrueCommand));
    engine.register_command("false", Arc::new(FalseCommand));
    (engine, sink)
}

#[tokio::test]
async fn scenario_1_plain_echo() {
    let (engine, sink) = engine_with_sink();
    let result = engine.execute(r#"echo "hello""#, ExecOptions::default()).await.unwrap();
    assert!(matches!(result, Outcome::Value(_) | Outcome::Status(true)));
    assert_eq!(sink.lines(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn scenario_2_variables_and_tilde() {
    let (engine, sink) = engine_with_sink();
    engine.execute("x: 7 ; y: 3 ; echo ~x, ~y", ExecOptions::default()).await.unwrap();
    assert_eq!(sink.lines(), vec!["7 3".to_string()]);
}

#[tokio::test]
async fn scenario_3_pipe_runs_on_failure_only() {
    let (engine, sink) = engine_with_sink();
    engine.execute("false & echo should-not-run | echo ran", ExecOptions::default()).await.unwrap();
    assert_eq!(sink.lines(), vec!["ran".to_string()]);
}

#[tokio::test]
async fn scenario_4_unpack_assignment() {
    let (engine, sink) = engine_with_sink();
    engine.execute("(a, b): (1, 2) ; echo ~a, ~b", ExecOptions::default()).await.unwrap();
    assert_eq!(sink.lines(), vec!["1 2".to_string()]);
}

#[tokio::test]
async fn scenario_5_macro_invocation() {
    let (engine, sink) = engine_with_sink();
    engine.define_macro("greet", r#"echo "hi", $1"#).unwrap();
    engine.execute(r#"greet "world""#, ExecOptions::default()).await.unwrap();
    assert_eq!(sink.lines(), vec!["hi world".to_string()]);
}

#[tokio::test]
async fn scenario_5_macro_definition_from_script_text() {
    let (engine, sink) = engine_with_sink();
    engine
        .execute(r#"macro greet (who) { echo "hi", $1 } ; greet "world""#, ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(sink.lines(), vec!["hi world".to_string()]);
}

#[tokio::test]
async fn macro_declared_parameter_resolves_by_name() {
    let (engine, sink) = engine_with_sink();
    engine
        .execute(r#"macro greet (who) { echo "hi", ~who } ; greet "world""#, ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(sink.lines(), vec!["hi world".to_string()]);
}

mod suspend_command {
    use pawscript::executor::{CommandHandler, ExecResult, HandlerContext};
    use pawscript::object_store::ObjectStore;
    use pawscript::state::ExecutionState;
    use pawscript::token_manager::TokenManager;

    /// A command that always suspends, standing in for a real async host
    /// callback (§8 scenario 6).
    pub struct SuspendCommand;

    impl CommandHandler for SuspendCommand {
        fn call(&self, mut ctx: HandlerContext, _store: &ObjectStore, tokens: &TokenManager) -> (ExecutionState, ExecResult) {
            let token = ctx.request_token(tokens, None);
            (ctx.state, ExecResult::Token(token))
        }
    }
}

#[tokio::test]
async fn scenario_6_token_resume_in_semicolon_sequence() {
    let (engine, sink) = engine_with_sink();
    engine.register_command("suspend", Arc::new(suspend_command::SuspendCommand));

    let result = engine.execute("echo before ; suspend ; echo after", ExecOptions::default()).await.unwrap();
    let token = match result {
        Outcome::Token(t) => t,
        _ => panic!("expected the sequence to suspend"),
    };
    assert_eq!(sink.lines(), vec!["before".to_string()]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.resume_token(&token, true, None).unwrap();
    assert_eq!(sink.lines(), vec!["before".to_string(), "after".to_string()]);
}

#[tokio::test]
async fn scenario_6_token_resume_in_amp_sequence() {
    let (engine, sink) = engine_with_sink();
    engine.register_command("suspend", Arc::new(suspend_command::SuspendCommand));

    let result = engine.execute("suspend & echo after", ExecOptions::default()).await.unwrap();
    let token = match result {
        Outcome::Token(t) => t,
        _ => panic!("expected the sequence to suspend"),
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.resume_token(&token, true, None).unwrap();
    assert_eq!(sink.lines(), vec!["after".to_string()]);
}

#[tokio::test]
async fn macro_hygiene_does_not_leak_positional_args() {
    let (engine, sink) = engine_with_sink();
    engine.define_macro("inner", "echo $1").unwrap();
    engine.execute(r#"inner "one""#, ExecOptions::default()).await.unwrap();
    // $1 at top level (outside any macro) resolves to nothing meaningful
    // and must not have been bound by the macro invocation above.
    let before = sink.lines().len();
    engine.execute("echo top-level", ExecOptions::default()).await.unwrap();
    assert_eq!(sink.lines().len(), before + 1);
    assert_eq!(sink.lines().last().unwrap(), "top-level");
}
