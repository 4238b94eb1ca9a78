// TCP 序列号是 32 位，按模 2^32 比较（和 ACK 过滤器里的 wrapping_sub 同一套路）

pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_gt(a, b) { a } else { b }
}
