/// AsyncIterator is the pull-based lazy sequence every stage of a packet
/// pipeline speaks: `try_next` returns `Ok(None)` once the stream is
/// drained. Dropping an iterator is the cancellation signal for whatever
/// producer feeds it.
#[async_trait]
pub trait AsyncIterator {
    type Item;
    async fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>>;
}

/// collect drains an iterator into a vector. Mostly a test convenience.
pub async fn collect<I>(it: &mut I) -> anyhow::Result<Vec<I::Item>>
where
    I: AsyncIterator + Send,
    I::Item: Send,
{
    let mut vs = Vec::new();
    while let Some(v) = it.try_next().await? {
        vs.push(v);
    }
    Ok(vs)
}
