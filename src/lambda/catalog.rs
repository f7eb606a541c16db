//! Catalogue shaping for instance type listings.

use crate::provider::{Catalog, InstanceType};

use super::wire::InstanceTypesData;

/// Converts the wire listing into a [`Catalog`], collapsing each entry's
/// available regions into a set.
pub(super) fn catalog_from_wire(data: InstanceTypesData) -> Catalog {
    data.into_iter()
        .map(|(name, entry)| {
            let regions = entry
                .regions_with_capacity_available
                .into_iter()
                .map(|region| region.name)
                .collect();
            let instance_type = InstanceType {
                name: name.clone(),
                description: entry.instance_type.description,
                price_cents_per_hour: entry.instance_type.price_cents_per_hour,
                regions,
            };
            (name, instance_type)
        })
        .collect()
}

/// Keeps only the instance types with capacity in at least one region.
///
/// Filtering an already filtered catalogue returns it unchanged.
#[must_use]
pub fn available_instance_types(catalog: &Catalog) -> Catalog {
    catalog
        .iter()
        .filter(|(_, instance_type)| instance_type.is_available())
        .map(|(name, instance_type)| (name.clone(), instance_type.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn wire(value: serde_json::Value) -> InstanceTypesData {
        serde_json::from_value(value).expect("fixture should decode")
    }

    fn listing() -> InstanceTypesData {
        wire(json!({
            "gpu_1x_a10": {
                "instance_type": {
                    "name": "gpu_1x_a10",
                    "description": "1x A10 (24 GB PCIe)",
                    "price_cents_per_hour": 75
                },
                "regions_with_capacity_available": [
                    {"name": "us-east-1", "description": "Virginia, USA"},
                    {"name": "us-west-1", "description": "California, USA"},
                    {"name": "us-east-1", "description": "Virginia, USA"}
                ]
            },
            "gpu_8x_h100": {
                "instance_type": {
                    "name": "gpu_8x_h100",
                    "description": "8x H100 (80 GB SXM5)",
                    "price_cents_per_hour": 2392
                },
                "regions_with_capacity_available": []
            }
        }))
    }

    #[test]
    fn regions_are_collapsed_into_a_set() {
        let catalog = catalog_from_wire(listing());
        let a10 = catalog.get("gpu_1x_a10").expect("a10 should be listed");
        let regions: Vec<&str> = a10.regions.iter().map(String::as_str).collect();
        assert_eq!(regions, vec!["us-east-1", "us-west-1"]);
        assert_eq!(a10.price_cents_per_hour, 75);
        assert_eq!(a10.description, "1x A10 (24 GB PCIe)");
    }

    #[test]
    fn unavailable_types_are_excluded() {
        let available = available_instance_types(&catalog_from_wire(listing()));
        assert!(available.contains_key("gpu_1x_a10"));
        assert!(!available.contains_key("gpu_8x_h100"));
        assert_eq!(available.len(), 1);
    }

    #[rstest]
    #[case(json!({}))]
    #[case(json!({
        "gpu_1x_a100": {
            "instance_type": {"description": "1x A100", "price_cents_per_hour": 129},
            "regions_with_capacity_available": [{"name": "us-south-1"}]
        }
    }))]
    #[case(json!({
        "gpu_2x_a6000": {
            "instance_type": {"description": "2x A6000", "price_cents_per_hour": 160}
        }
    }))]
    fn filtering_is_idempotent(#[case] value: serde_json::Value) {
        let once = available_instance_types(&catalog_from_wire(wire(value)));
        let twice = available_instance_types(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_capacity_field_counts_as_unavailable() {
        let catalog = catalog_from_wire(wire(json!({
            "gpu_1x_h100_pcie": {
                "instance_type": {"description": "1x H100", "price_cents_per_hour": 249}
            }
        })));
        assert!(available_instance_types(&catalog).is_empty());
    }
}
