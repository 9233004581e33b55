use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    config::normalize_api_url, load_settings, CoordinatorError, EventCoordinator, EventView,
    HttpEventStore, InMemorySessionStore, SessionStore,
};
use serde_json::{json, Value};
use shared::{
    domain::{EventCategory, EventId, EventStatus, NotificationId, Role, SubscriptionId},
    protocol::{EventDraft, EventNotificationRequest, EventQuery, RegisterRequest},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eventsync", about = "Manage events and subscriptions from the terminal")]
struct Cli {
    /// Overrides the configured API base URL.
    #[arg(long, env = "EVENTSYNC_API_URL")]
    api_url: Option<String>,
    #[arg(long, env = "EVENTSYNC_EMAIL")]
    email: Option<String>,
    #[arg(long, env = "EVENTSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    List {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        category: Option<EventCategory>,
        /// Local filter over title, description and location.
        #[arg(long)]
        search: Option<String>,
    },
    Show {
        event_id: String,
    },
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "sem_categoria")]
        category: EventCategory,
        #[arg(long)]
        banner: Option<String>,
        /// RFC 3339 start, e.g. 2030-05-10T14:00:00Z
        #[arg(long)]
        date: DateTime<Utc>,
        #[arg(long)]
        end_date: Option<DateTime<Utc>>,
        #[arg(long)]
        location: String,
        #[arg(long, default_value_t = 0)]
        workload: u32,
        #[arg(long)]
        capacity: u32,
    },
    /// Changes only the given fields of an event.
    Edit {
        event_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        category: Option<EventCategory>,
        #[arg(long)]
        banner: Option<String>,
        #[arg(long)]
        date: Option<DateTime<Utc>>,
        #[arg(long)]
        end_date: Option<DateTime<Utc>>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        workload: Option<u32>,
        #[arg(long)]
        capacity: Option<u32>,
    },
    Transition {
        event_id: String,
        status: EventStatus,
    },
    Subscriptions {
        event_id: String,
        state: Toggle,
    },
    Delete {
        event_id: String,
    },
    Subscribe {
        event_id: String,
    },
    Unsubscribe {
        event_id: String,
    },
    Remove {
        event_id: String,
        subscription_id: String,
        #[arg(long)]
        reason: String,
    },
    Notify {
        event_id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        message: String,
    },
    MySubscriptions,
    MyEvents,
    Notifications,
    MarkRead {
        notification_id: String,
    },
    MarkAllRead,
    WatchNotifications,
    /// Creates an account; sign in afterwards with --email/--password.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: String,
        #[arg(long, value_enum, default_value = "participant")]
        role: AccountRole,
    },
    Profile,
    UpdateName {
        name: String,
    },
    ChangePassword {
        #[arg(long, env = "EVENTSYNC_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
        #[arg(long, env = "EVENTSYNC_CONFIRM_PASSWORD", hide_env_values = true)]
        confirm: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AccountRole {
    Participant,
    Organizer,
}

impl From<AccountRole> for Role {
    fn from(value: AccountRole) -> Self {
        match value {
            AccountRole::Participant => Role::Participant,
            AccountRole::Organizer => Role::Organizer,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    Open,
    Close,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings()?;
    if let Some(api_url) = cli.api_url.as_deref() {
        settings.api_url = normalize_api_url(api_url)?;
    }

    let session: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let http = Arc::new(HttpEventStore::new(&settings, Arc::clone(&session))?);
    let credentials = Credentials {
        email: cli.email,
        password: cli.password,
    };
    if let Command::Register { name, city, role } = cli.command {
        let request = RegisterRequest {
            name,
            email: credentials.email.ok_or_else(|| anyhow!("--email is required"))?,
            password: credentials
                .password
                .ok_or_else(|| anyhow!("--password is required"))?,
            city: Some(city),
            role: role.into(),
        };
        let user = http.register(&request).await.map_err(report)?;
        println!("{}", serde_json::to_string_pretty(&user)?);
        return Ok(());
    }
    if let (Some(email), Some(password)) =
        (credentials.email.as_deref(), credentials.password.as_deref())
    {
        let user = http.login(email, password).await.map_err(report)?;
        info!(user_id = %user.id, role = ?user.role, "signed in");
    }

    let coordinator = EventCoordinator::new(http.clone(), Arc::clone(&session), &settings);
    let ctx = Context {
        coordinator,
        http,
        credentials,
        poll_every: settings.notification_poll_interval(),
    };
    match run(&ctx, cli.command).await {
        Ok(Some(output)) => println!("{}", serde_json::to_string_pretty(&output)?),
        Ok(None) => {}
        Err(err) => match err.downcast::<CoordinatorError>() {
            Ok(err) if err.is_silent() => {}
            Ok(err) => return Err(report(err)),
            Err(err) => return Err(err),
        },
    }
    Ok(())
}

struct Credentials {
    email: Option<String>,
    password: Option<String>,
}

struct Context {
    coordinator: Arc<EventCoordinator>,
    http: Arc<HttpEventStore>,
    credentials: Credentials,
    poll_every: std::time::Duration,
}

async fn run(ctx: &Context, command: Command) -> Result<Option<Value>> {
    let coordinator = &ctx.coordinator;
    let value = match command {
        Command::List {
            name,
            category,
            search,
        } => {
            let query = EventQuery { name, category };
            to_json(coordinator.list_events(&query, search.as_deref()).await?)?
        }
        Command::Show { event_id } => {
            let view = coordinator.event_view(&EventId::new(event_id)).await?;
            view_json(&view)
        }
        Command::Create {
            title,
            description,
            category,
            banner,
            date,
            end_date,
            location,
            workload,
            capacity,
        } => {
            let draft = EventDraft {
                title,
                description,
                category,
                banner,
                date,
                end_date,
                location,
                workload,
                capacity,
            };
            to_json(coordinator.create_event(&draft).await?)?
        }
        Command::Edit {
            event_id,
            title,
            description,
            category,
            banner,
            date,
            end_date,
            location,
            workload,
            capacity,
        } => {
            let event_id = EventId::new(event_id);
            let mut draft = EventDraft::from(&coordinator.event(&event_id).await?);
            draft.title = title.unwrap_or(draft.title);
            draft.description = description.unwrap_or(draft.description);
            draft.category = category.unwrap_or(draft.category);
            draft.banner = banner.or(draft.banner);
            draft.date = date.unwrap_or(draft.date);
            draft.end_date = end_date.or(draft.end_date);
            draft.location = location.unwrap_or(draft.location);
            draft.workload = workload.unwrap_or(draft.workload);
            draft.capacity = capacity.unwrap_or(draft.capacity);
            to_json(coordinator.update_event(&event_id, &draft).await?)?
        }
        Command::Transition { event_id, status } => {
            let outcome = coordinator
                .request_transition(&EventId::new(event_id), status)
                .await?;
            if outcome.close_subscriptions_advised {
                eprintln!(
                    "note: subscriptions are still open on a {} event; consider closing them",
                    outcome.event.status
                );
            }
            to_json(outcome.event)?
        }
        Command::Subscriptions { event_id, state } => {
            let open = matches!(state, Toggle::Open);
            to_json(
                coordinator
                    .set_subscriptions_open(&EventId::new(event_id), open)
                    .await?,
            )?
        }
        Command::Delete { event_id } => {
            let event_id = EventId::new(event_id);
            coordinator.delete_event(&event_id).await?;
            json!({ "deleted": event_id })
        }
        Command::Subscribe { event_id } => {
            to_json(coordinator.subscribe(&EventId::new(event_id)).await?)?
        }
        Command::Unsubscribe { event_id } => {
            let event_id = EventId::new(event_id);
            coordinator.unsubscribe_from_event(&event_id).await?;
            json!({ "unsubscribed": event_id })
        }
        Command::Remove {
            event_id,
            subscription_id,
            reason,
        } => {
            let subscription_id = SubscriptionId::new(subscription_id);
            coordinator
                .remove_participant(&EventId::new(event_id), &subscription_id, &reason)
                .await?;
            json!({ "removed": subscription_id })
        }
        Command::Notify {
            event_id,
            title,
            message,
        } => {
            coordinator
                .send_event_notification(
                    &EventId::new(event_id),
                    &EventNotificationRequest { title, message },
                )
                .await?;
            json!({ "sent": true })
        }
        Command::MySubscriptions => to_json(coordinator.my_subscriptions().await?)?,
        Command::MyEvents => to_json(coordinator.my_events().await?)?,
        Command::Notifications => to_json(coordinator.notifications().await?)?,
        Command::MarkRead { notification_id } => {
            let notification_id = NotificationId::new(notification_id);
            coordinator.mark_notification_read(&notification_id).await?;
            json!({ "read": notification_id })
        }
        Command::MarkAllRead => {
            coordinator.mark_all_notifications_read().await?;
            json!({ "unread": 0 })
        }
        Command::WatchNotifications => {
            watch_notifications(coordinator, ctx.poll_every).await?;
            return Ok(None);
        }
        Command::Register { .. } => return Err(anyhow!("register runs before sign-in")),
        Command::Profile => to_json(ctx.http.me().await?)?,
        Command::UpdateName { name } => {
            let profile = ctx.http.me().await?;
            to_json(ctx.http.update_name(&profile, &name).await?)?
        }
        Command::ChangePassword {
            new_password,
            confirm,
        } => {
            let current = ctx
                .credentials
                .password
                .as_deref()
                .ok_or_else(|| anyhow!("--password is required"))?;
            let profile = ctx.http.me().await?;
            ctx.http
                .change_password(&profile, current, &new_password, &confirm)
                .await?;
            json!({ "passwordChanged": true })
        }
    };
    Ok(Some(value))
}

async fn watch_notifications(
    coordinator: &Arc<EventCoordinator>,
    every: std::time::Duration,
) -> Result<(), CoordinatorError> {
    // Fail fast instead of polling without a session.
    coordinator.unread_notification_count().await?;
    let poller = coordinator.notification_poller(every);
    let mut unread = poller.unread();
    loop {
        tokio::select! {
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *unread.borrow_and_update();
                println!("{}", json!({ "unread": count }));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.stop();
    Ok(())
}

fn view_json(view: &EventView) -> Value {
    json!({
        "event": view.event,
        "subscribers": view.subscribers,
        "subscriberCount": view.subscriber_count(),
        "spotsLeft": view.spots_left(),
        "isOverCapacity": view.is_over_capacity(),
        "canSubscribe": view.can_subscribe(),
    })
}

fn to_json(value: impl serde::Serialize) -> serde_json::Result<Value> {
    serde_json::to_value(value)
}

fn report(err: CoordinatorError) -> anyhow::Error {
    anyhow!(err.user_message())
}
