use tokio::io::{AsyncRead, AsyncReadExt};

async fn fold_words<R, F>(r: &mut R, mut f: F) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(u16),
{
    let mut buf = [0u8; 8192];
    let mut carry: Option<u8> = None;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            // a lone trailing byte does not make a word
            return Ok(());
        }
        let mut bs = &buf[..n];
        if let Some(hi) = carry.take() {
            f(u16::from_be_bytes([hi, bs[0]]));
            bs = &bs[1..];
        }
        let mut pairs = bs.chunks_exact(2);
        for pair in &mut pairs {
            f(u16::from_be_bytes([pair[0], pair[1]]));
        }
        carry = pairs.remainder().first().copied();
    }
}

/// sum_rfc1071 computes the 16-bit ones'-complement word sum of the
/// source, big-endian, with the usual end-around carry fold.
pub async fn sum_rfc1071<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<u16> {
    let mut s: u32 = 0;
    fold_words(r, |v| s += v as u32).await?;
    while s >> 16 > 0 {
        s = (s & 0xFFFF) + (s >> 16);
    }
    Ok(s as u16)
}

/// sum_fletcher32 computes the Fletcher-32 sum over big-endian words.
pub async fn sum_fletcher32<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<u32> {
    const MOD: u32 = (1 << 16) - 1;
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    fold_words(r, |v| {
        sum1 = (sum1 + v as u32) % MOD;
        sum2 = (sum2 + sum1) % MOD;
    })
    .await?;
    Ok((sum2 << 16) | sum1)
}
