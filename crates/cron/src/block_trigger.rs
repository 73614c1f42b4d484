/// Fire blocks for an interval cron: every `b = offset + k·interval` with
/// `k ≥ 1`, `last_triggered < b ≤ current`, in order.
pub fn fires(last_triggered: u64, current: u64, interval: u64, offset: u64) -> Vec<u64> {
    assert!(interval > 0, "interval is validated at config load");

    let mut k = if last_triggered > offset {
        (last_triggered - offset) / interval + 1
    } else {
        1
    };

    let mut out = Vec::new();
    loop {
        let Some(block) = offset.checked_add(k * interval) else {
            break;
        };
        if block > current {
            break;
        }
        if block > last_triggered {
            out.push(block);
        }
        k += 1;
    }
    out
}
