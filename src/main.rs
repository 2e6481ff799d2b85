//! Demo chat loop over the session controller, using the canned in-process
//! backend (optionally behind the worker proxy).

use std::env;
use std::io::Write;
use std::sync::Arc;

use anyhow::anyhow;
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::{Builder, Runtime};

use tokio_llm_session::core::models::ModelRegistry;
use tokio_llm_session::core::session::ChatSession;
use tokio_llm_session::core::traits::InferenceBackend;
use tokio_llm_session::infrastructure::echo::EchoBackend;
use tokio_llm_session::infrastructure::worker::WorkerBackend;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(chat_loop())
}

async fn chat_loop() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let registry = ModelRegistry::from_env()?;
    let model_key = env::var("MODEL_KEY").unwrap_or_else(|_| "dolphin-2.2.1".to_owned());
    let model = registry
        .get(&model_key)
        .ok_or_else(|| anyhow!("unknown model '{model_key}'"))?
        .clone();

    let backend: Arc<dyn InferenceBackend> = if env::var("LLM_WORKER").is_ok() {
        info!("delegating backend to a worker task");
        Arc::new(WorkerBackend::spawn(EchoBackend::new()))
    } else {
        Arc::new(EchoBackend::new())
    };

    let session = ChatSession::new(
        backend,
        Some(Arc::new(|fraction, message| {
            info!("loading {:3.0}% - {message}", fraction * 100.0);
        })),
    );

    session.load(model.clone()).await?;
    println!("{} loaded. /reset clears history, /quit exits.", model.simple_name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                session.reset_history().await?;
                println!("(history cleared)");
                continue;
            }
            _ => {}
        }

        let mut printed = 0usize;
        let result = session
            .ask(
                input,
                Some(Box::new(move |text: &str| {
                    print!("{}", &text[printed..]);
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                })),
                Some(Box::new(|_final_text: &str| {
                    println!();
                })),
                false,
            )
            .await;

        if let Err(err) = result {
            error!("{err}");
        }
    }

    session.unload(false).await?;
    Ok(())
}
