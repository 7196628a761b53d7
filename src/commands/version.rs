use anyhow::Result;

pub fn run() -> Result<()> {
    println!("kube-appwrapper {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
