use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::prelude::*;

use gweb::config::Config;
use gweb::relay::engine::Engine;
use gweb::relay::gemini::GeminiWeb;
use gweb::relay::queue::DeliveryQueue;
use gweb::relay::settings::Settings;
use gweb::relay::store::Store;
use gweb::relay::telegram::TelegramClient;
use gweb::transcribe::Transcriber;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gweb.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gweb.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gweb...");
    info!("Loaded config from {config_path}");
    info!("Owner ID: {}", config.owner_id);

    let temp_dir = config.data_dir.join("tmp");
    std::fs::create_dir_all(&temp_dir).expect("Failed to create temp directory");

    let store = Arc::new(Store::open(&config.data_dir.join("gweb.db")));
    let settings = Settings::new(store);

    let client = Arc::new(TelegramClient::new(bot.clone(), config.owner_id));
    let queue = Arc::new(DeliveryQueue::new());
    queue.ensure_started(client.clone());

    let upstream = Arc::new(GeminiWeb::new(
        &config.secure_1psid,
        config.secure_1psidts.as_deref(),
        temp_dir.clone(),
    ));

    let transcriber = config
        .stt_provider
        .map(|provider| Arc::new(Transcriber::new(provider, config.stt_token())));
    if let Some(provider) = config.stt_provider {
        info!("Transcription enabled via {:?}", provider);
    }

    let engine = Engine::new(
        config.owner_id,
        client.clone(),
        client,
        upstream,
        settings,
        queue,
        transcriber,
        Duration::from_secs(config.quiet_window_secs),
        temp_dir,
    );

    let handler = Update::filter_message().endpoint(
        |msg: Message, engine: Arc<Engine>| async move {
            engine.handle_message(msg).await;
            ResponseResult::Ok(())
        },
    );

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
