// Manual smoke client: authenticates, opens a conversation with a peer and
// prints every frame the server pushes back.
//
//   CHAT_URL=ws://127.0.0.1:5000 CHAT_TOKEN=<session> CHAT_PEER=<user-id> \
//     cargo run --bin chat_probe
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::var("CHAT_URL").unwrap_or_else(|_| "ws://127.0.0.1:5000".to_string());
    let token = std::env::var("CHAT_TOKEN")
        .map_err(|_| anyhow::anyhow!("CHAT_TOKEN must hold a session token"))?;
    let peer = std::env::var("CHAT_PEER")
        .map_err(|_| anyhow::anyhow!("CHAT_PEER must hold the counterpart's user id"))?;

    let url = url::Url::parse(&url)?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut sender, mut receiver) = ws_stream.split();

    let auth = serde_json::json!({ "type": "auth", "token": token });
    sender.send(Message::Text(auth.to_string())).await?;

    let send = serde_json::json!({
        "type": "send_message",
        "to_user": peer,
        "content": "probe message",
    });
    sender.send(Message::Text(send.to_string())).await?;

    while let Some(frame) = receiver.next().await {
        match frame? {
            Message::Text(text) => println!("<- {}", text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
