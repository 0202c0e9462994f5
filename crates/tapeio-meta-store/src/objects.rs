//! Object location records

use crate::store::{MetaStore, MetaStoreResult};
use crate::tables;
use chrono::Utc;
use tapeio_common::{ObjectEntry, ObjectLocation};

fn object_key(container: &str, object_name: &str) -> String {
    format!("{container}\0{object_name}")
}

impl MetaStore {
    /// Insert or replace the record of an object
    pub fn put_object(&self, object: &ObjectEntry) -> MetaStoreResult<()> {
        self.put_bincode(
            tables::OBJECTS,
            &object_key(&object.container, &object.object_name),
            object,
        )
    }

    pub fn find_object(
        &self,
        container: &str,
        object_name: &str,
    ) -> MetaStoreResult<Option<ObjectEntry>> {
        self.get_bincode(tables::OBJECTS, &object_key(container, object_name))
    }

    /// Look up many objects of a container. Unknown names are skipped.
    pub fn bulk_find_objects(
        &self,
        container: &str,
        object_names: &[String],
    ) -> MetaStoreResult<Vec<ObjectEntry>> {
        let keys: Vec<String> = object_names
            .iter()
            .map(|name| object_key(container, name))
            .collect();
        self.bulk_get_bincode(tables::OBJECTS, &keys)
    }

    /// Move an object to a new location, provided the record still refers
    /// to the same loose file. Returns `false` if the object was deleted or
    /// overwritten in the meantime.
    pub fn update_object_location(
        &self,
        container: &str,
        object_name: &str,
        storage_id: &str,
        location: ObjectLocation,
    ) -> MetaStoreResult<bool> {
        self.update_bincode::<ObjectEntry, _>(
            tables::OBJECTS,
            &object_key(container, object_name),
            |object| {
                if object.storage_id != storage_id {
                    return false;
                }
                object.location = location;
                object.last_modified = Utc::now();
                true
            },
        )
    }

    /// Delete an object record. With `storage_id` set, the record is only
    /// removed if it still refers to that loose file.
    pub fn delete_object(
        &self,
        container: &str,
        object_name: &str,
        storage_id: Option<&str>,
    ) -> MetaStoreResult<bool> {
        let key = object_key(container, object_name);
        match storage_id {
            Some(storage_id) => self.delete_bincode_if::<ObjectEntry, _>(
                tables::OBJECTS,
                &key,
                |object| object.storage_id == storage_id,
            ),
            None => self.delete_key(tables::OBJECTS, &key),
        }
    }

    /// All objects of a container, ordered by name
    pub fn list_objects(&self, container: &str) -> MetaStoreResult<Vec<ObjectEntry>> {
        self.scan_bincode(tables::OBJECTS, &format!("{container}\0"), |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeio_common::{ArchiveId, DigestAlgorithm, TarEntryDescription};
    use tempfile::tempdir;

    fn object(container: &str, name: &str, storage_id: &str) -> ObjectEntry {
        ObjectEntry {
            container: container.into(),
            object_name: name.into(),
            storage_id: storage_id.into(),
            size: 3,
            digest_algorithm: DigestAlgorithm::Sha512,
            digest: "d".into(),
            location: ObjectLocation::InputFile,
            last_access: Utc::now(),
            last_modified: Utc::now(),
        }
    }

    fn in_tar() -> ObjectLocation {
        ObjectLocation::InTar(vec![TarEntryDescription {
            archive_id: ArchiveId::new_unchecked("t1.tar"),
            entry_name: "c/o1-s1-0".into(),
            start_offset: 0,
            size: 3,
            entry_digest: "e".into(),
        }])
    }

    #[test]
    fn test_location_update_requires_same_storage_id() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        store.put_object(&object("c", "o1", "s1")).unwrap();

        assert!(!store.update_object_location("c", "o1", "s0", in_tar()).unwrap());
        assert!(!store.update_object_location("c", "nope", "s1", in_tar()).unwrap());
        assert!(store.update_object_location("c", "o1", "s1", in_tar()).unwrap());

        let found = store.find_object("c", "o1").unwrap().unwrap();
        assert_eq!(found.location, in_tar());
    }

    #[test]
    fn test_bulk_find_and_list() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open_with_batch_size(dir.path().join("meta.redb"), 2).unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            store.put_object(&object("c1", name, name)).unwrap();
        }
        store.put_object(&object("c2", "a", "a")).unwrap();

        let names: Vec<String> = ["e", "a", "zz", "c"].iter().map(|s| (*s).to_string()).collect();
        let found = store.bulk_find_objects("c1", &names).unwrap();
        let found: Vec<&str> = found.iter().map(|o| o.object_name.as_str()).collect();
        assert_eq!(found, vec!["e", "a", "c"]);

        assert_eq!(store.list_objects("c1").unwrap().len(), 5);
        assert_eq!(store.list_objects("c2").unwrap().len(), 1);
        assert!(store.list_objects("c").unwrap().is_empty());
    }

    #[test]
    fn test_conditional_delete() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        store.put_object(&object("c", "o1", "s1")).unwrap();

        assert!(!store.delete_object("c", "o1", Some("other")).unwrap());
        assert!(store.delete_object("c", "o1", Some("s1")).unwrap());
        assert!(!store.delete_object("c", "o1", None).unwrap());
        assert!(store.find_object("c", "o1").unwrap().is_none());
    }
}
