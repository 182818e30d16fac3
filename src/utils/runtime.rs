use anyhow::Result;

/// The daemon intentionally runs on a current-thread runtime. All engine
/// state is touched from one task at a time and the only real parallelism
/// (input hooks, the database connection) lives on dedicated OS threads.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
