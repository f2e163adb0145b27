use anyhow::Context;
use clap::{Parser, Subcommand};
use quadlink_auth::AuthError;
use quadlink_backend_runtime::{shutdown_signal, telemetry, BackendServices};
use quadlink_config::load as load_config;
use quadlink_gateway::{create_router, GatewayState};
use sqlx::Row;
use tokio::net::TcpListener;
use tracing::info;

const SEED_USERS: [(&str, &str); 3] = [
    ("alice", "Alice"),
    ("bob", "Bob"),
    ("carol", "Carol"),
];

#[derive(Parser)]
#[command(name = "quadlink-backend")]
#[command(about = "Quadlink realtime backend (serves by default)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve,
    /// Create test users, make them mutual contacts and print session tokens
    SeedData,
    /// Dump chats and their members from the database
    DumpData,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server().await,
        Commands::SeedData => seed_data().await,
        Commands::DumpData => dump_data().await,
    }
}

async fn initialise() -> anyhow::Result<(quadlink_config::AppConfig, BackendServices)> {
    let config = load_config().context("failed to load configuration")?;
    let services = BackendServices::initialise(&config)
        .await
        .context("failed to initialise backend services")?;
    Ok((config, services))
}

async fn run_server() -> anyhow::Result<()> {
    info!("starting Quadlink backend");

    let (config, services) = initialise().await?;
    let sweeper = services.hub.spawn_idle_sweeper();

    let app = create_router(GatewayState::new(services.hub.clone()));

    let address = format!("{}:{}", config.http.address, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    info!(%address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("backend shut down");
    Ok(())
}

async fn seed_data() -> anyhow::Result<()> {
    info!("seeding database with test users");

    let (_, services) = initialise().await?;
    let authenticator = &services.authenticator;

    let mut users = Vec::with_capacity(SEED_USERS.len());
    for (username, display_name) in SEED_USERS {
        let user = match authenticator.create_user(username, Some(display_name)).await {
            Ok(user) => user,
            Err(AuthError::UserExists) => authenticator
                .find_by_username(username)
                .await?
                .with_context(|| format!("user {username} vanished during seeding"))?,
            Err(error) => return Err(error).context("failed to create seed user"),
        };
        users.push(user);
    }

    for (index, user) in users.iter().enumerate() {
        for other in &users[index + 1..] {
            authenticator
                .add_contact(user.id, other.id)
                .await
                .context("failed to link seed contacts")?;
        }
    }

    println!("Database seeded with {} users (all mutual contacts):", users.len());
    println!("{:<5} {:<12} Token", "ID", "Username");
    println!("{}", "-".repeat(70));
    for user in &users {
        let session = authenticator
            .issue_session(user.id)
            .await
            .context("failed to issue seed session")?;
        println!("{:<5} {:<12} {}", user.id, user.username, session.token);
    }
    println!("Connect with ws://<host>/ws?token=<token>");

    Ok(())
}

async fn dump_data() -> anyhow::Result<()> {
    info!("dumping chats from database");

    let (_, services) = initialise().await?;

    let chats = sqlx::query(
        r#"
        SELECT c.id, c.kind, c.name, c.only_admins_can_post, c.created_at,
               (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id) AS message_count
        FROM chats c
        ORDER BY c.created_at ASC
        "#,
    )
    .fetch_all(&services.db_pool)
    .await
    .context("failed to fetch chats")?;

    println!("=== CHATS ===");
    if chats.is_empty() {
        println!("No chats found in database");
    } else {
        println!("Found {} chats:", chats.len());
        println!(
            "{:<28} {:<8} {:<24} {:<12} {:<10} {:<25}",
            "ID", "Kind", "Name", "Admins Only", "Messages", "Created At"
        );
        println!("{}", "-".repeat(112));

        for chat in chats {
            let id: String = chat.get("id");
            let kind: String = chat.get("kind");
            let name: Option<String> = chat.get("name");
            let only_admins: bool = chat.get("only_admins_can_post");
            let message_count: i64 = chat.get("message_count");
            let created_at: String = chat.get("created_at");

            println!(
                "{:<28} {:<8} {:<24} {:<12} {:<10} {:<25}",
                id,
                kind,
                name.as_deref().unwrap_or("-"),
                only_admins,
                message_count,
                created_at
            );
        }
    }

    println!("\n=== CHAT MEMBERS ===");
    let members = sqlx::query(
        r#"
        SELECT cm.chat_id, cm.user_id, u.username, cm.role, cm.joined_at, cm.last_read_at
        FROM chat_members cm
        LEFT JOIN users u ON u.id = cm.user_id
        ORDER BY cm.chat_id, cm.joined_at ASC
        "#,
    )
    .fetch_all(&services.db_pool)
    .await
    .context("failed to fetch chat members")?;

    if members.is_empty() {
        println!("No chat members found in database");
    } else {
        println!("Found {} chat members:", members.len());
        println!(
            "{:<28} {:<8} {:<12} {:<8} {:<25} {:<25}",
            "Chat ID", "User ID", "Username", "Role", "Joined At", "Last Read"
        );
        println!("{}", "-".repeat(110));

        for member in members {
            let chat_id: String = member.get("chat_id");
            let user_id: i64 = member.get("user_id");
            let username: Option<String> = member.get("username");
            let role: String = member.get("role");
            let joined_at: String = member.get("joined_at");
            let last_read_at: Option<String> = member.get("last_read_at");

            println!(
                "{:<28} {:<8} {:<12} {:<8} {:<25} {:<25}",
                chat_id,
                user_id,
                username.as_deref().unwrap_or("?"),
                role,
                joined_at,
                last_read_at.as_deref().unwrap_or("NULL")
            );
        }
    }

    Ok(())
}
