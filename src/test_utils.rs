use crate::address::DeviceAddress;

/// A stable device address for unit tests.
pub const TEST_ADDRESS: DeviceAddress = DeviceAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build a weight indication carrying `centi_kg` and a device timestamp.
pub fn weight_payload(centi_kg: u16, device_secs: u32) -> Vec<u8> {
    let mut payload = vec![0x1D];
    payload.extend_from_slice(&centi_kg.to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00]);
    payload.extend_from_slice(&device_secs.to_le_bytes());
    payload
}

/// Build a body-composition indication.
///
/// The four percentage/mass fields are given in tenths; `high_nibble` is
/// OR-ed into the second byte of each to check masking.
pub fn body_composition_payload(
    device_secs: u32,
    kcal: u16,
    tenths: [u16; 4],
    high_nibble: u8,
) -> Vec<u8> {
    let mut payload = vec![0x6F];
    payload.extend_from_slice(&device_secs.to_le_bytes());
    payload.push(0x00);
    payload.extend_from_slice(&kcal.to_le_bytes());
    for field in tenths {
        let [lo, hi] = field.to_le_bytes();
        payload.push(lo);
        payload.push(hi | (high_nibble << 4));
    }
    payload
}

/// Build a profile indication for `profile`.
pub fn profile_payload(profile: u8) -> Vec<u8> {
    vec![0x00, 0x00, profile, 0x00]
}
