//! Simple example of using rotating-proxy-pool.

use reqwest_middleware::ClientBuilder;
use rotating_proxy_pool::{ProxyPoolConfig, ProxyPoolMiddleware};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        // scheme defaults to http:// when omitted
        .proxies(vec![
            "127.0.0.1:8118",
            "http://localhost:3128",
            "socks5://127.0.0.1:1080",
        ])
        .backoff_base(Duration::from_secs(60))
        .backoff_cap(Duration::from_secs(1800))
        .page_retry_times(3)
        .request_timeout(Duration::from_secs(10))
        // rate limit for each proxy host, lower performance but avoid banned
        .max_requests_per_second(3.0)
        .build();

    let proxy_pool = ProxyPoolMiddleware::new(config)?;
    let pool = proxy_pool.pool().clone();

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(proxy_pool)
        .build();

    println!("Sending request...");
    let response = client.get("https://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);
    println!("{pool}");

    Ok(())
}
