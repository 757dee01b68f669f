mod api;
mod builder;
mod cli;
mod conf;
mod container_host;
mod events;
mod model;
mod scheduler;
mod snapshotter;
mod source;

#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() {
    cli::init().await;
}
