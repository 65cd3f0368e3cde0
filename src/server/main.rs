// Entry point for the stanza-chat realtime server.
use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;

use stanza_chat::server::bus::RedisEventBus;
use stanza_chat::server::config::ServerConfig;
use stanza_chat::server::db::Database;
use stanza_chat::server::gateway::ChatGateway;
use stanza_chat::server::messages::MessageService;
use stanza_chat::server::presence::RedisPresenceStore;
use stanza_chat::server::rooms::RoomService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let db = Database::connect(&config.database_url).await?;
    info!("running database migrations...");
    db.migrate().await.map_err(|e| {
        error!("database migration failed: {}", e);
        e
    })?;
    info!("database migrations completed");

    let presence = Arc::new(
        RedisPresenceStore::connect(&config.redis_url, config.presence_ttl_secs).await?,
    );
    let bus = Arc::new(RedisEventBus::connect(&config.redis_url).await?);
    info!("connected to redis at {}", config.redis_url);

    let rooms = RoomService::new(db.clone());
    let messages = Arc::new(MessageService::new(
        db.clone(),
        rooms.clone(),
        presence.clone(),
        bus.clone(),
        config.max_message_length,
    ));

    let gateway = Arc::new(ChatGateway::new(
        db,
        rooms,
        messages,
        presence,
        bus,
        config.clone(),
    ));
    gateway.clone().start_event_forwarder();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("chat gateway listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("new connection from {}", peer);
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    if let Err(e) = gateway.handle_connection(ws_stream).await {
                        error!("connection from {} ended with error: {}", peer, e);
                    }
                }
                Err(e) => error!("websocket handshake with {} failed: {}", peer, e),
            }
        });
    }
}
