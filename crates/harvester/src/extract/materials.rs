//! Positional material/quantity pairing.
//!
//! Quantities are scraped from the container's text in reading order and
//! matched to material images by position. A single `NNK` token is treated as
//! the currency cost and paired with the first image. This depends on the page
//! listing quantities in the same order as the images and is not a contract.

use serde::{Deserialize, Serialize};

use crate::document::Element;
use crate::value::{FieldMap, FieldValue};

const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];

/// Quantity used when an image has no positional partner.
pub const DEFAULT_QUANTITY: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    pub quantity: String,
}

impl From<Material> for FieldValue {
    fn from(m: Material) -> Self {
        let mut map = FieldMap::new();
        map.insert("name", m.name);
        map.insert("quantity", m.quantity);
        FieldValue::Map(map)
    }
}

/// `12` or `30K`.
pub fn is_quantity(token: &str) -> bool {
    let token = token.trim();
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    match token.strip_suffix('K') {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Pair `images` with the quantities found in `details`.
pub fn pair_materials(details: &str, images: &[String]) -> Vec<Material> {
    let quantities: Vec<&str> = details
        .split_whitespace()
        .filter(|t| is_quantity(t))
        .collect();
    let currency = quantities.iter().copied().find(|q| q.ends_with('K'));

    let pair = |name: &String, quantity: Option<&str>| Material {
        name: name.clone(),
        quantity: quantity.unwrap_or(DEFAULT_QUANTITY).to_string(),
    };

    match (currency, images.split_first()) {
        (Some(currency), Some((first, rest))) => {
            let others: Vec<&str> = quantities
                .iter()
                .copied()
                .filter(|q| *q != currency)
                .collect();
            std::iter::once(Material {
                name: first.clone(),
                quantity: currency.to_string(),
            })
            .chain(rest.iter().enumerate().map(|(i, name)| pair(name, others.get(i).copied())))
            .collect()
        }
        _ => images
            .iter()
            .enumerate()
            .map(|(i, name)| pair(name, quantities.get(i).copied()))
            .collect(),
    }
}

/// Drop a trailing image file extension, case-insensitively.
pub fn strip_image_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for ext in IMAGE_EXTENSIONS {
        if lower.ends_with(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

/// Material name for an image: `alt`, then `data-image-name`, then the last
/// segment of `src`. Images whose name contains an ignored word are skipped.
pub fn image_name(image: &Element, ignore: &[String]) -> Option<String> {
    let name = [image.attr("alt"), image.attr("data-image-name")]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .or_else(|| image.attr("src").and_then(|src| src.rsplit('/').next()))
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    let lower = name.to_lowercase();
    if ignore.iter().any(|w| lower.contains(&w.to_lowercase())) {
        return None;
    }
    Some(strip_image_extension(name).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ElementHandle;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn img(attrs: &[(&str, &str)]) -> Element {
        Element {
            handle: ElementHandle::new(1, 0),
            tag: "img".into(),
            text: String::new(),
            html: String::new(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_quantity_tokens() {
        assert!(is_quantity("5"));
        assert!(is_quantity("20K"));
        assert!(!is_quantity("K"));
        assert!(!is_quantity("Elite"));
        assert!(!is_quantity("2.5K"));
    }

    #[test]
    fn test_currency_pairs_with_first_image() {
        let materials = pair_materials(
            "Requires LMD 20K Medic Chip 5 Orirock 3",
            &names(&["LMD", "Medic Chip", "Orirock Cube"]),
        );
        assert_eq!(
            materials,
            vec![
                Material { name: "LMD".into(), quantity: "20K".into() },
                Material { name: "Medic Chip".into(), quantity: "5".into() },
                Material { name: "Orirock Cube".into(), quantity: "3".into() },
            ]
        );
    }

    #[test]
    fn test_missing_quantities_default_to_one() {
        let materials = pair_materials("Elite 2 requires 4", &names(&["Chip", "Device"]));
        assert_eq!(materials[0].quantity, "2");
        assert_eq!(materials[1].quantity, "4");

        let materials = pair_materials("nothing here", &names(&["Chip"]));
        assert_eq!(materials[0].quantity, DEFAULT_QUANTITY);
    }

    #[test]
    fn test_image_names() {
        let ignore = vec!["icon".to_string()];
        assert_eq!(
            image_name(&img(&[("alt", "Orirock Cube.png")]), &ignore),
            Some("Orirock Cube".to_string())
        );
        assert_eq!(
            image_name(&img(&[("alt", ""), ("src", "https://x/img/Device.JPG")]), &ignore),
            Some("Device".to_string())
        );
        assert_eq!(image_name(&img(&[("alt", "Class Icon")]), &ignore), None);
        assert_eq!(image_name(&img(&[]), &ignore), None);
    }
}
