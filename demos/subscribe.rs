use futures::StreamExt;
use pubsub_cdc::{
    auth::{LoginConfig, LoginGrant, login},
    checkpoint::{CheckpointStore, FileCheckpointStore},
    client::{Client, ClientConfig},
    subscription::SubscribeRequest,
    types::{ReplayStart, TopicName},
};
use tokio::select;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let topic: TopicName = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PUBSUB_TOPIC").ok())
        .unwrap_or_else(|| "/data/Employee__ChangeEvent".to_string())
        .parse()?;

    // Log in when a connected app is configured, else expect a session in
    // the PUBSUB_ACCESS_TOKEN, PUBSUB_INSTANCE_URL and PUBSUB_TENANT_ID vars.
    let config = match std::env::var("PUBSUB_LOGIN_URL") {
        Ok(login_url) => {
            let grant = match std::env::var("PUBSUB_USERNAME") {
                Ok(username) => LoginGrant::Password {
                    username,
                    password: std::env::var("PUBSUB_PASSWORD")?.into(),
                },
                Err(_) => LoginGrant::ClientCredentials,
            };
            let credentials = login(&LoginConfig::new(
                login_url.parse()?,
                std::env::var("PUBSUB_CLIENT_ID")?,
                std::env::var("PUBSUB_CLIENT_SECRET")?,
                grant,
            ))
            .await?;
            ClientConfig::new(credentials)
        }
        Err(_) => ClientConfig::from_env()?,
    };
    let client = Client::new(config)?;

    let info = client.get_topic(topic.clone()).await?;
    println!("topic {} uses schema {}", info.topic_name, info.schema_id);

    let checkpoints = FileCheckpointStore::new(
        std::env::var("PUBSUB_CHECKPOINT_FILE")
            .unwrap_or_else(|_| "pubsub-checkpoints.json".to_string()),
    );
    let replay_start = ReplayStart::resume_or(checkpoints.load(&topic).await?, ReplayStart::Latest);

    let req = SubscribeRequest::new(topic.clone())
        .with_replay_start(replay_start)
        .with_batch_size(10);
    let mut events = client.change_events(req);
    loop {
        select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) => println!("{}", serde_json::to_string_pretty(&event.to_json()?)?),
                    Err(err) if err.replay_id().is_some() => eprintln!("skipping event: {err}"),
                    Err(err) => return Err(err.into()),
                }
                if let Some(replay_id) = events.last_replay_id() {
                    checkpoints.save(&topic, &replay_id).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
