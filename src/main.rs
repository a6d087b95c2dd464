use archive_bot::rate_limiter::{AbuseGuard, Decision};
use archive_bot::utils::{block_status_text, gate, is_admin, run_sweep, send_warning, spawn_sweeper};
use archive_bot::{Settings, SweepConfig};
use dotenv::dotenv;
use std::sync::Arc;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::{prelude::*, utils::command::BotCommands};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Bot commands")]
enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Show this help")]
    Help,
    #[command(description = "Show anti-spam status (admin: /status <user_id>)")]
    Status(String),
    #[command(description = "Sweep stale anti-spam data (admin only)")]
    Sweep,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Status(_) => "status",
            Command::Sweep => "sweep",
        }
    }
}

fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("Categories", "categories"),
            InlineKeyboardButton::callback("Search", "search"),
        ],
        vec![InlineKeyboardButton::callback("Upload", "upload")],
    ])
}

fn upload_label(msg: &Message) -> Option<&'static str> {
    if msg.document().is_some() {
        Some("upload_file")
    } else if msg.photo().is_some() {
        Some("upload_photo")
    } else if msg.video().is_some() {
        Some("upload_video")
    } else if msg.audio().is_some() {
        Some("upload_audio")
    } else if msg.voice().is_some() {
        Some("upload_voice")
    } else if msg.video_note().is_some() {
        Some("upload_video_note")
    } else {
        None
    }
}

async fn warn_user(bot: &Bot, msg: &Message, decision: Decision) -> bool {
    match decision {
        Decision::Allow => true,
        Decision::Deny(reason) => {
            if let Err(e) = send_warning(bot, msg.chat.id, &reason).await {
                log::error!("Error sending antispam warning: {}", e);
            }
            false
        }
    }
}

async fn answer(
    bot: Bot,
    msg: Message,
    cmd: Command,
    guard: Arc<AbuseGuard>,
    sweep: Arc<SweepConfig>,
) -> Result<(), teloxide::RequestError> {
    let Some(user_id) = msg.from().map(|user| user.id.0) else {
        return Ok(());
    };
    if !warn_user(&bot, &msg, gate(&guard, &sweep, user_id, cmd.label())).await {
        return Ok(());
    }

    match cmd {
        Command::Start => {
            bot.send_message(msg.chat.id, "Hello! I'm the file archive bot.")
                .reply_markup(main_menu())
                .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string()).await?;
        }
        Command::Status(args) => {
            let target = args.trim();
            if target.is_empty() {
                bot.send_message(msg.chat.id, "No active restrictions.").await?;
            } else if !is_admin(&guard, user_id) {
                bot.send_message(msg.chat.id, "Only the admin can check other users.").await?;
            } else if let Ok(target_id) = target.parse::<u64>() {
                let text = block_status_text(target_id, guard.block_time_left(target_id));
                bot.send_message(msg.chat.id, text).await?;
            } else {
                bot.send_message(msg.chat.id, "Usage: /status <user_id>").await?;
            }
        }
        Command::Sweep => {
            if is_admin(&guard, user_id) {
                let text = match run_sweep(&guard) {
                    Some(removed) => format!("Cleanup removed {} entries.", removed.total()),
                    None => "Cleanup failed, see logs.".to_string(),
                };
                bot.send_message(msg.chat.id, text).await?;
            } else {
                bot.send_message(msg.chat.id, "Only the admin can run cleanup.").await?;
            }
        }
    }
    Ok(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    guard: Arc<AbuseGuard>,
    sweep: Arc<SweepConfig>,
) -> Result<(), teloxide::RequestError> {
    let Some(user_id) = msg.from().map(|user| user.id.0) else {
        return Ok(());
    };
    let label = match (upload_label(&msg), msg.text()) {
        (Some(label), _) => label,
        // Commands are routed to `answer`; unknown ones land here.
        (None, Some(text)) if !text.starts_with('/') => "text_input",
        _ => return Ok(()),
    };
    if !warn_user(&bot, &msg, gate(&guard, &sweep, user_id, label)).await {
        return Ok(());
    }

    if label.starts_with("upload_") {
        log::info!("User {} uploaded via {}", user_id, label);
        bot.send_message(msg.chat.id, "File received.").await?;
    } else {
        log::debug!("Text input from user {}", user_id);
    }
    Ok(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    guard: Arc<AbuseGuard>,
    sweep: Arc<SweepConfig>,
) -> Result<(), teloxide::RequestError> {
    let label = format!("button_{}", q.data.as_deref().unwrap_or_default());
    match gate(&guard, &sweep, q.from.id.0, &label) {
        Decision::Allow => {
            bot.answer_callback_query(q.id).await?;
        }
        Decision::Deny(reason) => {
            bot.answer_callback_query(q.id)
                .text(reason.to_string())
                .show_alert(true)
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return;
        }
    };

    let bot = Bot::from_env();
    let guard = Arc::new(AbuseGuard::new(settings.guard));
    let sweep = Arc::new(settings.sweep);

    if spawn_sweeper(guard.clone(), &sweep).is_none() {
        log::warn!(
            "Periodic cleanup disabled - sweeping on {}% of requests",
            sweep.probability * 100.0
        );
    }

    log::info!("Starting archive bot with anti-spam protection");

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint({
                            let guard = guard.clone();
                            let sweep = sweep.clone();
                            move |bot: Bot, msg: Message, cmd: Command| {
                                let guard = guard.clone();
                                let sweep = sweep.clone();
                                async move { answer(bot, msg, cmd, guard, sweep).await }
                            }
                        }),
                )
                .branch(dptree::endpoint({
                    let guard = guard.clone();
                    let sweep = sweep.clone();
                    move |bot: Bot, msg: Message| {
                        let guard = guard.clone();
                        let sweep = sweep.clone();
                        async move { handle_message(bot, msg, guard, sweep).await }
                    }
                })),
        )
        .branch(Update::filter_callback_query().endpoint({
            let guard = guard.clone();
            let sweep = sweep.clone();
            move |bot: Bot, q: CallbackQuery| {
                let guard = guard.clone();
                let sweep = sweep.clone();
                async move { handle_callback(bot, q, guard, sweep).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
