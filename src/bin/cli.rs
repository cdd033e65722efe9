use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use std::fs;

const TOKEN_FILE: &str = ".circlein_token";

#[derive(Parser)]
#[command(name = "circlein-cli")]
#[command(about = "CLI for the CircleIn booking API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "CIRCLEIN_URL", default_value = "http://localhost:11111")]
    url: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Sweep {
    Expire,
    Reminders,
    Complete,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Me,
    /// Join a community with an access code
    Redeem {
        #[arg(short, long)]
        code: String,
        #[arg(short, long)]
        flat: Option<String>,
    },
    Amenities,
    Book {
        #[arg(short, long)]
        amenity: String,
        /// RFC 3339, e.g. 2030-06-01T18:00:00Z
        #[arg(short, long)]
        start: DateTime<Utc>,
        #[arg(short, long)]
        end: DateTime<Utc>,
    },
    Bookings,
    Cancel {
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    Confirm {
        #[arg(short, long)]
        id: String,
    },
    Decline {
        #[arg(short, long)]
        id: String,
    },
    GenerateCodes {
        #[arg(short = 'C', long)]
        community: Option<String>,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
    },
    ClearBookings {
        #[arg(short = 'C', long)]
        community: Option<String>,
        /// Must be CLEAR_ALL_BOOKINGS_CONFIRMED
        #[arg(long)]
        confirm: String,
    },
    /// Trigger a cron sweep
    Sweep {
        #[arg(value_enum)]
        job: Sweep,
        #[arg(long, env = "CRON_SECRET")]
        secret: Option<String>,
    },
    Logout,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

fn authed(request: RequestBuilder) -> RequestBuilder {
    let token = fs::read_to_string(TOKEN_FILE).unwrap_or_default();
    request.bearer_auth(token.trim())
}

async fn print_response(request: RequestBuilder) -> Result<()> {
    let res = request.send().await.context("request failed")?;
    let status = res.status();
    let body = res.text().await?;
    let pretty = serde_json::from_str::<serde_json::Value>(&body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or(body);
    println!("{status}\n{pretty}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let client = Client::new();
    let api = format!("{}/api", cli.url.trim_end_matches('/'));

    match cli.command {
        Commands::Register { email, password, name } => {
            print_response(
                client
                    .post(format!("{api}/auth/register"))
                    .json(&json!({ "email": email, "password": password, "name": name })),
            )
            .await?;
        }
        Commands::Login { email, password } => {
            let res = client
                .post(format!("{api}/auth/login"))
                .json(&json!({ "email": email, "password": password }))
                .send()
                .await?;
            if res.status().is_success() {
                let body: LoginResponse = res.json().await?;
                fs::write(TOKEN_FILE, body.token)?;
                println!("Logged in. Token saved to {TOKEN_FILE}");
            } else {
                println!("Login failed: {}", res.text().await?);
            }
        }
        Commands::Me => {
            print_response(authed(client.get(format!("{api}/users/me")))).await?;
        }
        Commands::Redeem { code, flat } => {
            print_response(
                authed(client.post(format!("{api}/auth/redeem-code")))
                    .json(&json!({ "code": code, "flatNumber": flat })),
            )
            .await?;
        }
        Commands::Amenities => {
            print_response(authed(client.get(format!("{api}/amenities")))).await?;
        }
        Commands::Book { amenity, start, end } => {
            print_response(authed(client.post(format!("{api}/bookings"))).json(&json!({
                "amenityId": amenity,
                "startTime": start,
                "endTime": end,
            })))
            .await?;
        }
        Commands::Bookings => {
            print_response(authed(client.get(format!("{api}/bookings")))).await?;
        }
        Commands::Cancel { id, reason } => {
            print_response(
                authed(client.post(format!("{api}/bookings/{id}/cancel")))
                    .json(&json!({ "reason": reason })),
            )
            .await?;
        }
        Commands::Confirm { id } => {
            print_response(authed(client.post(format!("{api}/bookings/{id}/confirm")))).await?;
        }
        Commands::Decline { id } => {
            print_response(authed(client.post(format!("{api}/bookings/{id}/decline")))).await?;
        }
        Commands::GenerateCodes { community, count } => {
            print_response(
                authed(client.post(format!("{api}/admin/onboarding/generate-codes")))
                    .json(&json!({ "communityId": community, "codeCount": count })),
            )
            .await?;
        }
        Commands::ClearBookings { community, confirm } => {
            print_response(
                authed(client.post(format!("{api}/admin/clear-bookings")))
                    .json(&json!({ "confirmationToken": confirm, "communityId": community })),
            )
            .await?;
        }
        Commands::Sweep { job, secret } => {
            let request = match job {
                Sweep::Expire => client.post(format!("{api}/cron/expire-waitlist")),
                Sweep::Reminders => client.get(format!("{api}/cron/booking-reminders")),
                Sweep::Complete => client.post(format!("{api}/cron/complete-bookings")),
            };
            let request = match secret {
                Some(secret) => request.bearer_auth(secret),
                None => request,
            };
            print_response(request).await?;
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (token removed).");
        }
    }

    Ok(())
}
