use tokio::sync::mpsc;

/// Multiplex N input streams into one.
///
/// One forwarding task per input; the output closes once every input has
/// closed and the last forwarder drops its sender clone. Used for the
/// per-TTL probe streams, the two receiver streams and the resolver pool
/// outputs.
pub fn merge<T: Send + 'static>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(inputs.len().max(1));
    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}
