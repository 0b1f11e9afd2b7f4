use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;

const AGENT_COUNT: usize = 5;
const LEAD_COUNT: usize = 1_000;
const STATUSES: [&str; 4] = ["pending", "contacted", "converted", "rejected"];
const FIRST_NAMES: [&str; 8] = ["Ada", "Bram", "Chen", "Dara", "Emil", "Farah", "Goran", "Hana"];

fn server_url() -> String {
    std::env::var("LEADHUB_URL").unwrap_or_else(|_| "http://localhost:5000".to_string())
}

/// Header plus `LEAD_COUNT` rows, with a sprinkling of rows missing a
/// required column that the server should drop.
fn generate_csv() -> (String, usize) {
    let mut rng = rand::thread_rng();
    let mut body = String::from("FirstName,Phone,Notes\n");
    let mut valid = 0;
    for i in 0..LEAD_COUNT {
        let name = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Lead");
        let phone = format!("+1555{:07}", rng.gen_range(0..10_000_000));
        if rng.gen_ratio(1, 20) {
            body.push_str(&format!(",{},missing name\n", phone));
        } else {
            body.push_str(&format!("{} {},{},row {}\n", name, i, phone, i));
            valid += 1;
        }
    }
    (body, valid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base = server_url();
    println!("--- Leadhub upload smoke test ---");
    println!("Target: {}", base);
    println!("Agents: {}  Rows: {}\n", AGENT_COUNT, LEAD_COUNT);

    let client = Client::new();
    let run_id: u32 = rand::thread_rng().gen();

    // 1. Admin account
    let admin_email = format!("smoke-admin-{}@example.com", run_id);
    let resp = client
        .post(format!("{}/api/auth/register", base))
        .json(&json!({ "name": "Smoke Admin", "email": admin_email, "password": "smoke-pass", "role": "admin" }))
        .send()
        .await?;
    println!("Register admin: {}", resp.status());

    let login: Value = client
        .post(format!("{}/api/auth/login", base))
        .json(&json!({ "email": admin_email, "password": "smoke-pass" }))
        .send()
        .await?
        .json()
        .await?;
    let token = login
        .get("token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("login failed: {}", login))?
        .to_string();

    // 2. Agents, created concurrently
    let start = Instant::now();
    let mut handles = vec![];
    for i in 0..AGENT_COUNT {
        let client = client.clone();
        let base = base.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            client
                .post(format!("{}/api/agents", base))
                .bearer_auth(token)
                .json(&json!({
                    "name": format!("Smoke Agent {}", i),
                    "email": format!("smoke-{}-{}@example.com", run_id, i),
                    "mobile": format!("+1444000{:04}", i),
                    "password": "agent-pass",
                }))
                .send()
                .await
                .map(|r| r.status())
        }));
    }
    for h in handles {
        let status = h.await??;
        if !status.is_success() {
            anyhow::bail!("agent creation failed: {}", status);
        }
    }
    println!("Agents created in {:.2?}", start.elapsed());

    // 3. Upload
    let (csv, expected) = generate_csv();
    let form = Form::new().part(
        "file",
        Part::bytes(csv.into_bytes())
            .file_name("smoke.csv")
            .mime_str("text/csv")?,
    );
    let start = Instant::now();
    let report: Value = client
        .post(format!("{}/api/upload", base))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await?
        .json()
        .await?;
    println!("Upload answered in {:.2?}: {}", start.elapsed(), report["message"]);

    // 4. Check the distribution adds up
    let distribution = report["distribution"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("upload failed: {}", report))?;
    let counts: Vec<usize> = distribution
        .iter()
        .map(|d| d["leads"].as_array().map(Vec::len).unwrap_or(0))
        .collect();
    let total: usize = counts.iter().sum();
    println!("Per-agent counts: {:?}", counts);
    if total != expected {
        anyhow::bail!("expected {} leads distributed, got {}", expected, total);
    }
    let (min, max) = (
        counts.iter().min().copied().unwrap_or(0),
        counts.iter().max().copied().unwrap_or(0),
    );
    if max - min > 1 {
        println!("Note: counts differ by {} (other active agents share the pool)", max - min);
    }

    // 5. Random status updates on a sample of the batch
    let lead_ids: Vec<String> = distribution
        .iter()
        .flat_map(|d| d["leads"].as_array().cloned().unwrap_or_default())
        .filter_map(|l| l["id"].as_str().map(str::to_string))
        .collect();
    let updates: Vec<(String, &str)> = {
        let mut rng = rand::thread_rng();
        lead_ids
            .choose_multiple(&mut rng, 50)
            .map(|id| (id.clone(), *STATUSES.choose(&mut rng).unwrap_or(&"contacted")))
            .collect()
    };

    let sent = updates.len();
    let start = Instant::now();
    let mut handles = vec![];
    for (id, status) in updates {
        let client = client.clone();
        let base = base.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            client
                .put(format!("{}/api/leads/{}/status", base, id))
                .bearer_auth(token)
                .json(&json!({ "status": status }))
                .send()
                .await
                .map(|r| r.status().is_success())
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await?? {
            ok += 1;
        }
    }
    println!("Status updates: {}/{} ok in {:.2?}", ok, sent, start.elapsed());
    if ok < sent {
        anyhow::bail!("{} of {} status updates failed", sent - ok, sent);
    }

    // 6. Listing sanity
    let page: Value = client
        .get(format!("{}/api/upload/leads/all?page=1&limit=10", base))
        .bearer_auth(&token)
        .send()
        .await?
        .json()
        .await?;
    println!(
        "Listing: {} leads total over {} pages",
        page["total"], page["totalPages"]
    );

    println!("\nSmoke test passed");
    Ok(())
}
