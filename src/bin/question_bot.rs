//! Two-step conversation: asks for a name on `/start`, then greets.
//!
//! `TELBOT_TOKEN` must be set; see `BotConfig` for the other variables.

use std::sync::Arc;
use std::time::Duration;
use telbot::config::init_tracing;
use telbot::{
    Bot, BotConfig, ConversationEngine, Dispatcher, InMemorySessionStore, LoggingTransport, Message,
    Poller, StageOutcome, Stages, Update,
};

type QuestionBot = Bot<LoggingTransport>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

async fn ask_name(bot: QuestionBot, update: Update) -> StageOutcome {
    let Some(chat_id) = update.chat_id() else {
        return StageOutcome::End;
    };
    bot.send_text(chat_id, "Hey! This is a question bot. What is your name?")
        .await
        .map(drop)
        .into()
}

async fn greet(bot: QuestionBot, update: Update) -> StageOutcome {
    let Some(chat_id) = update.chat_id() else {
        return StageOutcome::End;
    };
    let name = update.text().map(str::trim).filter(|name| !name.is_empty());
    let Some(name) = name else {
        return match bot.send_text(chat_id, "Please send your name as text.").await {
            Ok(_) => StageOutcome::Repeat,
            Err(e) => StageOutcome::failure(e),
        };
    };
    match bot.send_text(chat_id, format!("Nice to meet you {name}!")).await {
        Ok(_) => StageOutcome::End,
        Err(e) => StageOutcome::failure(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BotConfig::from_env()?;
    init_tracing(config.log_json);

    let transport = Arc::new(LoggingTransport::new(Arc::new(config.http_transport()?)));
    let bot = Bot::connect(transport).await?;

    let stages = {
        let (asker, greeter) = (bot.clone(), bot.clone());
        Stages::builder()
            .stage(move |update: Update| ask_name(asker.clone(), update))
            .stage(move |update: Update| greet(greeter.clone(), update))
            .build()?
    };

    let store = Arc::new(InMemorySessionStore::new().with_idle_timeout(IDLE_TIMEOUT));
    let engine = ConversationEngine::new(Arc::clone(&store));

    let (updates, poller) = Poller::new(Arc::clone(bot.transport()), config.poller_config()).start();
    let eviction = store.spawn_eviction(Duration::from_secs(60), poller.cancellation_token());

    let shutdown = poller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    });

    tracing::info!("Started polling updates");
    Dispatcher::new(config.max_concurrency)
        .run(updates, move |update: Update| {
            let (engine, stages) = (engine.clone(), stages.clone());
            async move {
                if update.message().and_then(Message::command) == Some("start") {
                    engine.start(&stages, &update).await?;
                } else if engine.has_active_for(&update).await {
                    engine.advance(&update).await?;
                }
                Ok::<(), telbot::BoxError>(())
            }
        })
        .await;

    poller.shutdown().await;
    eviction.await?;
    Ok(())
}
