use crossterm::style::Color;

/// (pod color, container color) pairs
pub const PALETTE: [(Color, Color); 6] = [
    (Color::Cyan, Color::DarkCyan),
    (Color::Green, Color::DarkGreen),
    (Color::Magenta, Color::DarkMagenta),
    (Color::Yellow, Color::DarkYellow),
    (Color::Blue, Color::DarkBlue),
    (Color::Red, Color::DarkRed),
];

/// 32-bit FNV-1
fn fnv1_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash: u32, byte| {
        hash.wrapping_mul(0x0100_0193) ^ u32::from(*byte)
    })
}

/// Palette slot for a name; the same name always gets the same slot
pub fn color_index(name: &str) -> usize {
    fnv1_32(name.as_bytes()) as usize % PALETTE.len()
}

/// Colors for a pod and its container. With `diff_container` the container
/// is colored by its own name instead of sharing the pod's pair.
pub fn colors_for(pod: &str, container: &str, diff_container: bool) -> (Color, Color) {
    let (pod_color, container_color) = PALETTE[color_index(pod)];
    if diff_container {
        return (pod_color, PALETTE[color_index(container)].1);
    }
    (pod_color, container_color)
}
