use logger::logger;
use server::server;

// Use jemalloc as the global allocator
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    logger::setup_logging();

    let ascii_logo = r#"
   ___  _____      _______  _____
  / _ \/ __/ | /| / /  _/ |/ / _ \
 / , _/ _/ | |/ |/ // //    / // /
/_/|_/___/ |__/|__/___/_/|_/____/
-----------------------------------------------
Versioned records with primary/replica failover
-----------------------------------------------
    "#;

    println!("{}", ascii_logo);

    let server = match server::Server::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
