use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;

use tandem::{
    BroadcastHub, Color, EloLedger, GreedySearch, LinkSimulation, Lobby, MemoryStore,
    OpponentClient, PlayerId, SearchBudget, Services, SessionClient, SessionEvent, SessionId,
    SessionRegistry, SessionState, SessionStatus, StandardChess, SyncConfig,
};

#[derive(Parser)]
#[command(name = "tandem-client")]
#[command(about = "Plays an engine-vs-engine session through the sync layer")]
struct Args {
    #[arg(long, default_value = "demo")]
    session: String,

    #[arg(long, default_value_t = 200, help = "Stop after this many plies")]
    max_plies: u32,

    #[arg(long, default_value_t = 2, help = "Search depth (1 or 2)")]
    depth: u8,

    #[arg(long, default_value_t = 0.0, help = "Broadcast loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Broadcast duplicate percentage (0-100)")]
    duplicate_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,

    #[arg(long, help = "Cut every subscription once this ply is reached")]
    drop_connection_at: Option<u32>,
}

impl Args {
    fn link(&self) -> LinkSimulation {
        LinkSimulation {
            enabled: self.loss_percent > 0.0
                || self.duplicate_percent > 0.0
                || self.max_latency > 0,
            loss_percent: self.loss_percent,
            duplicate_percent: self.duplicate_percent,
            min_latency_ms: self.min_latency,
            max_latency_ms: self.max_latency,
            jitter_ms: self.jitter,
        }
    }
}

fn log_events(name: &'static str, mut events: mpsc::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Advanced { .. } => log::debug!("[{}] {:?}", name, event),
                _ => log::info!("[{}] {:?}", name, event),
            }
        }
    });
}

async fn converge(client: &SessionClient, ply: u32, timeout: Duration) -> Result<SessionState> {
    let state = tokio::time::timeout(
        timeout,
        client.wait_for(|s| s.ply_index >= ply || s.status != SessionStatus::Playing),
    )
    .await
    .with_context(|| format!("{} did not reach ply {}", client.player(), ply))??;
    Ok(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(BroadcastHub::with_link(args.link()));
    let rules = Arc::new(StandardChess::new());
    let ledger = Arc::new(EloLedger::new());
    let config = SyncConfig::default();
    config.validate()?;

    let session_id = SessionId::new(args.session.clone());
    let white = PlayerId::new("white-bot");
    let black = PlayerId::new("black-bot");

    let lobby = Lobby::new(store.clone(), rules.clone());
    lobby
        .create_session(session_id.clone(), white.clone(), Color::White)
        .await?;
    lobby.join_session(&session_id, black.clone()).await?;

    let services = Services {
        store: store.clone(),
        broadcast: hub.clone(),
        rules,
        ratings: ledger.clone(),
        config: config.clone(),
    };

    // One registry per side, as if each player ran their own process.
    let mut white_side = SessionRegistry::new(services.clone());
    let mut black_side = SessionRegistry::new(services);
    log_events("white", white_side.attach(session_id.clone(), white.clone()).await?);
    log_events("black", black_side.attach(session_id.clone(), black.clone()).await?);

    let engine = Arc::new(GreedySearch);
    let white_engine = OpponentClient::spawn(engine.clone(), config.opponent_timeout);
    let black_engine = OpponentClient::spawn(engine, config.opponent_timeout);
    let budget = SearchBudget {
        depth: args.depth,
        ..Default::default()
    };
    let wait = config.persist_timeout * 4;

    let mut dropped = false;
    loop {
        let white_client = white_side.client(&session_id)?;
        let black_client = black_side.client(&session_id)?;
        let state = white_client.state();
        if state.status != SessionStatus::Playing || state.ply_index >= args.max_plies {
            break;
        }

        if !dropped && args.drop_connection_at.is_some_and(|ply| state.ply_index >= ply) {
            let feeds = store.drop_subscribers(&session_id);
            let channels = hub.drop_subscribers(&session_id);
            log::warn!(
                "Dropped {} change feeds and {} broadcast channels at ply {}",
                feeds,
                channels,
                state.ply_index
            );
            dropped = true;
        }

        let (mover, other, engine) = if white_client.is_my_turn() {
            (white_client, black_client, &white_engine)
        } else if black_client.is_my_turn() {
            (black_client, white_client, &black_engine)
        } else {
            // Neither mirror thinks it is on move; let them settle.
            converge(black_client, state.ply_index, wait).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };

        let applied = engine.play_turn(mover, budget).await?;
        log::info!(
            "ply {:>3} {} {}",
            applied.ply_index,
            applied.player(applied.turn().opposite()).map_or("?", |p| p.as_str()),
            applied.last_move().unwrap_or("-")
        );
        converge(other, applied.ply_index, wait).await?;
    }

    let white_client = white_side.client(&session_id)?;
    let black_client = black_side.client(&session_id)?;
    let final_ply = white_client.state().ply_index;
    converge(black_client, final_ply, wait).await?;

    // Give settlement a moment to land before reporting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let durable = store.peek(&session_id).context("session vanished from the store")?;
    let white_view = white_client.state();
    let black_view = black_client.state();

    println!();
    println!("Session {} after {} plies", durable.session_id, durable.ply_index);
    println!("  Status:      {}", durable.status);
    if let (Some(result), Some(reason)) = (durable.result, durable.termination) {
        println!("  Result:      {} by {}", result, reason);
    }
    println!("  Settled:     {}", durable.settlement_done);
    println!("  Position:    {}", durable.position);
    println!("  Moves:       {}", durable.move_log.join(" "));
    println!();
    for player in [&white, &black] {
        let rating = ledger.rating(player);
        println!(
            "  {:<10} elo {:>5} (W{} L{} D{})",
            player.as_str(),
            rating.elo,
            rating.wins,
            rating.losses,
            rating.draws
        );
    }
    let stats = hub.stats();
    let counters = store.counters();
    println!();
    println!(
        "  Broadcast:   {} published, {} delivered, {} dropped, {} duplicated",
        stats.frames_published,
        stats.frames_delivered,
        stats.frames_dropped,
        stats.frames_duplicated
    );
    println!(
        "  Store:       {} reads, {} writes, {} rejected, {} settlement attempts",
        counters.reads, counters.writes, counters.rejected_writes, counters.settlement_attempts
    );
    println!(
        "  Resyncs:     white {}, black {}",
        white_client.resync_requests(),
        black_client.resync_requests()
    );

    let converged = white_view == durable && black_view == durable;
    println!("  Converged:   {}", converged);

    white_side.detach_all().await;
    black_side.detach_all().await;

    if !converged {
        bail!("mirrors diverged from the durable state");
    }
    Ok(())
}
