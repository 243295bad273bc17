use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use ulid::Ulid;

use covoit_live::backend::{Ledger, MemoryBackend};
use covoit_live::config::Config;
use covoit_live::feed::MemoryFeed;
use covoit_live::fetch;
use covoit_live::model::{Trip, TripId};
use covoit_live::tracker::SeatTracker;

enum Command {
    List,
    Refresh,
    Reserve { trip_id: TripId, seats: u32, ledger: Ledger },
    Cancel { reservation_id: Ulid },
    Seats { trip_id: TripId, seats: u32 },
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let seats = |s: &str| s.parse::<u32>().map_err(|_| format!("bad seat count: {s}"));
    match words.as_slice() {
        ["list"] => Ok(Command::List),
        ["refresh"] => Ok(Command::Refresh),
        ["quit"] | ["exit"] => Ok(Command::Quit),
        ["reserve", trip, n] => Ok(Command::Reserve {
            trip_id: TripId::from(*trip),
            seats: seats(*n)?,
            ledger: Ledger::Current,
        }),
        ["reserve", trip, n, "legacy"] => Ok(Command::Reserve {
            trip_id: TripId::from(*trip),
            seats: seats(*n)?,
            ledger: Ledger::Legacy,
        }),
        ["cancel", id] => Ulid::from_string(*id)
            .map(|reservation_id| Command::Cancel { reservation_id })
            .map_err(|e| format!("bad reservation id: {e}")),
        ["seats", trip, n] => Ok(Command::Seats {
            trip_id: TripId::from(*trip),
            seats: seats(*n)?,
        }),
        _ => Err("commands: list | refresh | reserve <trip> <n> [legacy] | cancel <id> | seats <trip> <n> | quit".into()),
    }
}

fn load_trips(config: &Config) -> Result<Vec<Trip>, Box<dyn std::error::Error>> {
    let Some(path) = &config.trips_file else {
        let mut trips = fetch::fixtures();
        trips.push(
            Trip::new(Ulid::new().to_string(), 3)
                .with_route("Paris", "Rouen")
                .with_availability("agg-rouen"),
        );
        trips.push(Trip::new(Ulid::new().to_string(), 2).with_route("Nantes", "Angers"));
        return Ok(trips);
    };
    let json = std::fs::read_to_string(path)?;
    Ok(fetch::parse_trips(&json)?)
}

fn print_rows(tracker: &SeatTracker<MemoryFeed>) {
    for row in tracker.rows() {
        let marker = if row.live { "live" } else { "fixture" };
        let degraded = if tracker.is_degraded(&row.trip.id) { " (stale)" } else { "" };
        println!(
            "  {:<28} {:<24} {:>2} seats  {}{}",
            row.trip.id,
            row.trip.route(),
            row.seats,
            marker,
            degraded
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    covoit_live::observability::init(config.metrics_port)?;

    let feed = Arc::new(MemoryFeed::with_capacity(config.feed_capacity));
    let backend = MemoryBackend::new(feed.clone());
    for trip in load_trips(&config)? {
        backend.insert_trip(trip).await?;
    }

    let mut tracker = SeatTracker::new(feed.clone());
    tracker.track(backend.fetch_trips().await);
    tracker.settle().await;
    info!("covoit-live ready");
    info!("  trips: {}", tracker.trips().len());
    info!("  channels: {}", tracker.subscription_count());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );
    print_rows(&tracker);

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(notice) = tracker.next_notice() => {
                println!("* {notice}");
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("stdin error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                let result = match command {
                    Command::Quit => break,
                    Command::List => {
                        print_rows(&tracker);
                        Ok(())
                    }
                    Command::Refresh => {
                        tracker.track(backend.fetch_trips().await);
                        tracker.settle().await;
                        print_rows(&tracker);
                        Ok(())
                    }
                    Command::Reserve { trip_id, seats, ledger } => backend
                        .reserve(&trip_id, seats, ledger)
                        .await
                        .map(|id| println!("reservation {id}")),
                    Command::Cancel { reservation_id } => backend
                        .cancel(&reservation_id)
                        .await
                        .map(|trip_id| println!("cancelled on {trip_id}")),
                    Command::Seats { trip_id, seats } => {
                        backend.set_seats(&trip_id, seats).await
                    }
                };
                if let Err(e) = result {
                    println!("error: {e}");
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    tracker.unmount();
    info!("covoit-live stopped");
    Ok(())
}
