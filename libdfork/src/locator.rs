// ObjectLocator maps image names, image ids and object indices to the names of
// the objects that back an image in the object store.
//
// The object layout in the store is roughly as follows:
//
//	rbd_id.<image-name>                  name -> id lookup object
//	rbd_header.<image-id>                image header, carries the dirty-tracking state
//	rbd_object_map.<image-id>            object-existence map
//	rbd_data.<image-id>.<16 hex digits>  backing data objects, one per object index
//
// Names are pure functions of their inputs; empty ids or names are the
// caller's problem and are not rejected here.

pub const RBD_ID_PREFIX: &str = "rbd_id.";
pub const RBD_HEADER_PREFIX: &str = "rbd_header.";
pub const RBD_OBJECT_MAP_PREFIX: &str = "rbd_object_map.";
pub const RBD_DATA_PREFIX: &str = "rbd_data.";

/// Image id used when a switch targets every image of the pool.
pub const ALL_IMAGES_ID: &str = "default";

/// Returns the name of the id lookup object for an image name,
/// (e.g. `rbd_id.<name>`).
pub fn id_object_name(image_name: &str) -> String {
    format!("{RBD_ID_PREFIX}{image_name}")
}

/// Returns the name of the header object of an image,
/// (e.g. `rbd_header.<id>`).
pub fn header_object_name(image_id: &str) -> String {
    format!("{RBD_HEADER_PREFIX}{image_id}")
}

/// Returns the name of the object-existence map of an image,
/// (e.g. `rbd_object_map.<id>`).
pub fn object_map_name(image_id: &str) -> String {
    format!("{RBD_OBJECT_MAP_PREFIX}{image_id}")
}

/// Returns the index suffix used for a data object,
/// (e.g. `000000000000001f`).
pub fn object_index_suffix(object_no: u64) -> String {
    format!("{object_no:016x}")
}

/// Returns the name of a backing data object,
/// (e.g. `rbd_data.<id>.<16 hex digits>`).
pub fn data_object_name(image_id: &str, object_no: u64) -> String {
    format!(
        "{RBD_DATA_PREFIX}{image_id}.{}",
        object_index_suffix(object_no)
    )
}

/// Returns the name of the data object a dirty location refers to.
/// Locations are stored as bare suffixes relative to the image.
pub fn location_object_name(image_id: &str, location: &str) -> String {
    format!("{RBD_DATA_PREFIX}{image_id}.{location}")
}

/// Splits a data object name into its image id and suffix.
pub fn parse_data_object_name(oid: &str) -> Option<(&str, &str)> {
    let rest = oid.strip_prefix(RBD_DATA_PREFIX)?;
    let (image_id, suffix) = rest.rsplit_once('.')?;
    if image_id.is_empty() || suffix.is_empty() {
        return None;
    }
    Some((image_id, suffix))
}

/// Parses the object index out of a data object suffix.
pub fn parse_object_index(suffix: &str) -> Option<u64> {
    if suffix.len() != 16 {
        return None;
    }
    u64::from_str_radix(suffix, 16).ok()
}

/// Reduces a location to the suffix form stored in the location set. A full
/// data object name of `image_id` is stripped; anything else is kept as is.
pub fn location_suffix<'a>(image_id: &str, location: &'a str) -> &'a str {
    match parse_data_object_name(location) {
        Some((id, suffix)) if id == image_id => suffix,
        _ => location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names() {
        assert_eq!(id_object_name("vm-disk"), "rbd_id.vm-disk");
        assert_eq!(header_object_name("10ab"), "rbd_header.10ab");
        assert_eq!(object_map_name("10ab"), "rbd_object_map.10ab");
        assert_eq!(
            data_object_name("10ab", 0x1f),
            "rbd_data.10ab.000000000000001f"
        );
    }

    #[test]
    fn test_parse_data_object_name() {
        let oid = data_object_name("10ab", 42);
        let (id, suffix) = parse_data_object_name(&oid).unwrap();
        assert_eq!(id, "10ab");
        assert_eq!(parse_object_index(suffix), Some(42));
        assert!(parse_data_object_name("rbd_header.10ab").is_none());
        assert!(parse_object_index("2a").is_none());
    }

    #[test]
    fn test_location_suffix() {
        let oid = data_object_name("10ab", 7);
        assert_eq!(location_suffix("10ab", &oid), "0000000000000007");
        assert_eq!(location_suffix("ffff", &oid), oid);
        assert_eq!(location_suffix("10ab", "A"), "A");
        assert_eq!(
            location_object_name("10ab", "0000000000000007"),
            oid
        );
    }
}
