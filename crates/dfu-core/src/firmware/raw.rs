//! Raw binary: the whole buffer is a single element at address 0.

use super::{Element, Firmware, FirmwareError, FirmwareFormat, Image};

/// Gap fill used when flattening sparse images.
pub const FILL_BYTE: u8 = 0xFF;

pub fn parse(data: &[u8]) -> Result<Firmware, FirmwareError> {
    let mut firmware = Firmware::new();
    firmware.set_format(FirmwareFormat::Raw);
    firmware.add_image(image_from_payload(data)?);
    Ok(firmware)
}

pub fn write(firmware: &Firmware) -> Result<Vec<u8>, FirmwareError> {
    payload(firmware)
}

pub(crate) fn image_from_payload(data: &[u8]) -> Result<Image, FirmwareError> {
    if data.is_empty() {
        return Err(FirmwareError::malformed(0, "empty payload"));
    }
    let mut image = Image::new();
    image.add_element(Element::new(0, data.to_vec())?)?;
    Ok(image)
}

/// Bytes of the single image, gaps between elements filled.
pub(crate) fn payload(firmware: &Firmware) -> Result<Vec<u8>, FirmwareError> {
    let image = match firmware.images() {
        [] => return Err(FirmwareError::Unsupported("firmware has no images".into())),
        [only] => only,
        _ => {
            return Err(FirmwareError::Unsupported(
                "only DfuSe files can hold more than one image".into(),
            ));
        }
    };
    image
        .flatten(FILL_BYTE)
        .map(|(_, data)| data)
        .ok_or_else(|| FirmwareError::Unsupported("image has no elements".into()))
}
