//! Echoes text back in private chats; `/start` answers "Hello World!".

use std::sync::Arc;
use telbot::config::init_tracing;
use telbot::{Bot, BotConfig, ChatType, Dispatcher, LoggingTransport, Poller, Update};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BotConfig::from_env()?;
    init_tracing(config.log_json);

    let transport = Arc::new(LoggingTransport::new(Arc::new(config.http_transport()?)));
    let bot = Bot::connect(transport).await?;

    let (updates, poller) = Poller::new(Arc::clone(bot.transport()), config.poller_config()).start();

    let shutdown = poller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    });

    Dispatcher::new(config.max_concurrency)
        .run(updates, move |update: Update| {
            let bot = bot.clone();
            async move {
                let Some(message) = update.message() else {
                    return Ok(());
                };
                if message.chat.kind != ChatType::Private {
                    return Ok(());
                }
                let Some(text) = message.text.as_deref() else {
                    return Ok(());
                };

                let reply = if message.command() == Some("start") {
                    "Hello World!"
                } else {
                    text
                };
                bot.send_text(message.chat.id, reply).await?;
                Ok::<(), telbot::BoxError>(())
            }
        })
        .await;

    poller.shutdown().await;
    Ok(())
}
