//! Images and elements.

use super::FirmwareError;

/// A contiguous run of bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    address: u32,
    data: Vec<u8>,
}

impl Element {
    pub fn new(address: u32, data: Vec<u8>) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::InvalidElement(format!(
                "zero-length element at 0x{:08X}",
                address
            )));
        }
        if address as u64 + data.len() as u64 > u32::MAX as u64 + 1 {
            return Err(FirmwareError::InvalidElement(format!(
                "element at 0x{:08X} of {} bytes exceeds the 32-bit address space",
                address,
                data.len()
            )));
        }
        Ok(Self { address, data })
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn overlaps(&self, other: &Element) -> bool {
        (self.address as u64) < other.end() && (other.address as u64) < self.end()
    }
}

/// One firmware blob bound to an alternate setting.
///
/// An image without an alternate setting is the default image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    alt_setting: Option<u8>,
    name: Option<String>,
    elements: Vec<Element>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alt_setting(alt_setting: u8) -> Self {
        Self {
            alt_setting: Some(alt_setting),
            ..Self::default()
        }
    }

    pub fn alt_setting(&self) -> Option<u8> {
        self.alt_setting
    }

    pub fn set_alt_setting(&mut self, alt_setting: Option<u8>) {
        self.alt_setting = alt_setting;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    /// Append an element; fails if it overlaps an existing one.
    pub fn add_element(&mut self, element: Element) -> Result<(), FirmwareError> {
        if let Some(existing) = self.elements.iter().find(|e| e.overlaps(&element)) {
            return Err(FirmwareError::InvalidElement(format!(
                "element at 0x{:08X} overlaps element at 0x{:08X}",
                element.address(),
                existing.address()
            )));
        }
        self.elements.push(element);
        Ok(())
    }

    /// Payload bytes across all elements.
    pub fn size(&self) -> usize {
        self.elements.iter().map(Element::len).sum()
    }

    /// All elements flattened into one buffer starting at the lowest address,
    /// with gaps filled by `fill`.
    pub fn flatten(&self, fill: u8) -> Option<(u32, Vec<u8>)> {
        let start = self.elements.iter().map(|e| e.address).min()?;
        let end = self.elements.iter().map(Element::end).max()?;
        let mut buf = vec![fill; (end - start as u64) as usize];
        for e in &self.elements {
            let offset = (e.address - start) as usize;
            buf[offset..offset + e.len()].copy_from_slice(&e.data);
        }
        Some((start, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_element_rejected() {
        assert!(matches!(
            Element::new(0x100, Vec::new()),
            Err(FirmwareError::InvalidElement(_))
        ));
        assert!(Element::new(0xFFFF_FFFF, vec![0; 2]).is_err());
        assert!(Element::new(0xFFFF_FFFF, vec![0; 1]).is_ok());
    }

    #[test]
    fn test_overlap_rejected_sparse_allowed() {
        let mut image = Image::with_alt_setting(1);
        image.add_element(Element::new(0x0, vec![1; 0x10]).unwrap()).unwrap();
        image.add_element(Element::new(0x100, vec![2; 0x10]).unwrap()).unwrap();
        assert!(image.add_element(Element::new(0x8, vec![3; 4]).unwrap()).is_err());
        assert!(image.add_element(Element::new(0xFC, vec![3; 8]).unwrap()).is_err());
        image.add_element(Element::new(0x10, vec![4; 4]).unwrap()).unwrap();
        assert_eq!(image.elements().len(), 3);
        assert_eq!(image.size(), 0x24);
    }

    #[test]
    fn test_flatten_fills_gaps() {
        let mut image = Image::new();
        image.add_element(Element::new(0x12, vec![0xBB]).unwrap()).unwrap();
        image.add_element(Element::new(0x10, vec![0xAA]).unwrap()).unwrap();
        let (start, data) = image.flatten(0xFF).unwrap();
        assert_eq!(start, 0x10);
        assert_eq!(data, vec![0xAA, 0xFF, 0xBB]);
        assert!(Image::new().flatten(0).is_none());
    }
}
