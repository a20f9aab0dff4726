use crate::flasher::firmware::FirmwareImage;

/// Image of `len` bytes with a repeating, position-dependent pattern.
pub fn patterned_image(len: usize) -> FirmwareImage {
    FirmwareImage::from_bytes((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Builder for Intel HEX text with correct checksums.
pub struct HexFileBuilder {
    lines: Vec<String>,
    next_address: u16,
}

impl HexFileBuilder {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            next_address: 0,
        }
    }

    /// Append a data record at the running address.
    pub fn data(mut self, bytes: &[u8]) -> Self {
        let address = self.next_address;
        self.lines.push(record(0x00, address, bytes));
        self.next_address = address.wrapping_add(bytes.len() as u16);
        self
    }

    /// Append an extended linear address record.
    pub fn linear_address(mut self, upper: u16) -> Self {
        self.lines.push(record(0x04, 0, &upper.to_be_bytes()));
        self
    }

    /// Finish with an end-of-file record.
    pub fn build(mut self) -> String {
        self.lines.push(record(0x01, 0, &[]));
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

impl Default for HexFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn record(record_type: u8, address: u16, data: &[u8]) -> String {
    let [hi, lo] = address.to_be_bytes();
    let mut bytes = vec![data.len() as u8, hi, lo, record_type];
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    bytes.push((!sum).wrapping_add(1));

    let body: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!(":{}", body)
}
