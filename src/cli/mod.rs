pub mod args;

use crate::db::Database;
use crate::desk::Desk;
use crate::render::{render_message, strip_markup, RenderOptions};
use crate::settings;
use crate::stream::IngestOutcome;
use crate::transcript::{Message, MessageId, MessageStatus, TranscriptEvent};
use anyhow::{bail, Context};
use args::{Cli, Command, SettingsAction, UploadArgs};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = settings::data_dir();
    let db = Database::new(&data_dir)
        .with_context(|| format!("Failed to open local store in {}", data_dir.display()))?;

    // Settings edits work without touching the service.
    if let Command::Settings { action } = &cli.command {
        return run_settings(&db, action);
    }

    let config = settings::resolve_config(&db)?;
    tracing::debug!(base_url = %config.api.base_url, "service configured");
    let desk = Desk::new(db, config);

    match cli.command {
        Command::Upload(args) => upload(&desk, args).await,
        Command::Chat { message } => {
            let id = desk.send_chat(&message.join(" ")).await?;
            desk.persist()?;
            print_message(&desk, &id, RenderOptions::default());
            Ok(())
        }
        Command::History { remote: true, .. } => {
            let turns = desk.api().conversation().await?;
            if turns.is_empty() {
                println!("No conversation on the service for this session");
            }
            for turn in turns {
                println!("{}> {}", turn.role.as_str(), turn.content);
            }
            Ok(())
        }
        Command::History { limit, text, .. } => {
            let options = RenderOptions {
                show_text: text,
                show_original: false,
            };
            for message in desk.history(limit)? {
                println!(
                    "[{}] {}",
                    message.created_at.format("%Y-%m-%d %H:%M"),
                    render_message(&message, options)
                );
            }
            Ok(())
        }
        Command::Health => {
            let health = desk.api().health().await?;
            println!("status: {}", health.status);
            if let Some(count) = health.sessions_count {
                println!("sessions: {}", count);
            }
            if let Some(timestamp) = health.timestamp {
                println!("time: {}", timestamp);
            }
            Ok(())
        }
        Command::Tools => {
            let catalog = desk.api().tools().await?;
            for tool in &catalog.tools {
                println!("{:<28} {}", tool.name, tool.description);
            }
            if !catalog.supported_rules.is_empty() {
                println!("rules: {}", catalog.supported_rules.join(", "));
            }
            Ok(())
        }
        Command::Exports => {
            let files = desk.api().exports().await?;
            if files.is_empty() {
                println!("No exported files");
            }
            for file in files {
                println!(
                    "{:<40} {:>10}  {}",
                    file.filename,
                    crate::files::format_file_size(file.size),
                    file.created_time.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Download { filename, out } => {
            let target = out.unwrap_or_else(|| PathBuf::from(&filename));
            download(&desk, &filename, &target).await
        }
        Command::ClearSession => {
            if desk.clear_session().await? {
                println!("Session cleared");
            } else {
                println!("No active session");
            }
            Ok(())
        }
        Command::Settings { .. } => Ok(()),
    }
}

fn run_settings(db: &Database, action: &SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show => {
            let stored = settings::get_settings(db)?;
            if stored.is_empty() {
                println!("No stored settings; defaults apply");
            }
            for (key, value) in stored {
                println!("{} = {}", key, value);
            }
            let config = settings::resolve_config(db)?;
            println!("# effective service: {}", config.api.base_url);
            match config.idle_timeout {
                Some(timeout) => println!("# effective idle timeout: {}s", timeout.as_secs()),
                None => println!("# effective idle timeout: disabled"),
            }
        }
        SettingsAction::Set { key, value } => {
            settings::set_setting(db, key, value)?;
            println!("{} updated", key);
        }
        SettingsAction::Unset { key } => {
            settings::unset_setting(db, key)?;
            println!("{} cleared", key);
        }
    }
    Ok(())
}

fn print_message(desk: &Desk, id: &MessageId, options: RenderOptions) {
    if let Some(message) = desk.transcript().get(id) {
        println!("{}", render_message(&message, options));
    }
}

fn last_message(desk: &Desk) -> Option<Message> {
    desk.transcript().snapshot().pop()
}

async fn upload(desk: &Desk, args: UploadArgs) -> anyhow::Result<()> {
    let settings = args.apply(settings::load_anonymize_settings(desk.db())?);
    let options = RenderOptions {
        show_text: args.show_text,
        show_original: args.show_original,
    };

    let message = if args.legacy {
        match desk.upload_legacy(&args.file, &settings).await? {
            Some(id) => desk.transcript().get(&id),
            None => last_message(desk),
        }
    } else {
        follow_stream(desk, &args.file, settings).await?
    };
    desk.persist()?;

    let Some(message) = message else {
        bail!("upload produced no message");
    };
    println!("{}", render_message(&message, options));

    match message.status {
        MessageStatus::Completed => {}
        MessageStatus::Failed(kind) => bail!("upload did not complete ({})", kind.as_str()),
        MessageStatus::Pending => bail!("upload is still pending"),
    }

    if let Some(dir) = &args.download {
        let filename = message
            .attachment
            .as_ref()
            .and_then(|a| a.export.as_ref())
            .and_then(|e| e.export_filename.clone());
        match filename {
            Some(filename) => {
                let target = download_target(dir, &filename)?;
                download(desk, &filename, &target).await?
            }
            None => tracing::warn!("service reported no exported file to download"),
        }
    }
    Ok(())
}

/// Run a streamed upload, echoing progress to stderr. Ctrl-C cancels it.
async fn follow_stream(
    desk: &Desk,
    file: &Path,
    settings: crate::api::AnonymizeSettings,
) -> anyhow::Result<Option<Message>> {
    let mut events = desk.transcript().subscribe();
    let Some(handle) = desk.upload(file, settings)? else {
        return Ok(last_message(desk));
    };
    let id = handle.message_id().clone();
    let cancel = handle.cancellation_token();
    let wait = handle.wait();
    tokio::pin!(wait);

    let mut listening = true;
    let mut interrupted = false;
    let outcome = loop {
        tokio::select! {
            biased;
            event = events.recv(), if listening => match event {
                Ok(TranscriptEvent::Updated(message)) if message.id == id => {
                    eprintln!("{}", strip_markup(&message.content));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => listening = false,
            },
            outcome = &mut wait => break outcome?,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::info!("interrupted, cancelling upload");
                interrupted = true;
                cancel.cancel();
            }
        }
    };
    if let IngestOutcome::Failed(kind) = outcome {
        tracing::debug!(kind = kind.as_str(), "streamed upload failed");
    }
    Ok(desk.transcript().get(&id))
}

/// Where an exported file lands inside `dir`. Only a bare file name is
/// accepted from the service.
fn download_target(dir: &Path, filename: &str) -> anyhow::Result<PathBuf> {
    match Path::new(filename).file_name() {
        Some(name) if name == OsStr::new(filename) => Ok(dir.join(name)),
        _ => bail!("Refusing export file name from the service: {:?}", filename),
    }
}

async fn download(desk: &Desk, filename: &str, target: &Path) -> anyhow::Result<()> {
    let bytes = desk.api().download(filename).await?;
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    println!(
        "Saved {} ({})",
        target.display(),
        crate::files::format_file_size(bytes.len() as u64)
    );
    Ok(())
}
