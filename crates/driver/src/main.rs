use driver::runtime::{boot, serve};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    boot::init_logging()?;
    let (manager, config) = boot::boot()?;
    serve::serve(manager, config).await
}
