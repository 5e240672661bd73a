//! Represents one file to be placed in a generated archive.

use chrono::{DateTime, Utc};
use serde::{
    Deserialize, Deserializer,
    de::{self, IgnoredAny, MapAccess, Visitor},
};
use std::fmt;

/// A single entry of a reference record.
///
/// Records are written by another system, so field names match without regard
/// to ASCII case (`FileName`, `fileName`, `filename` ...) and the object key is
/// also accepted as `objectPath`. When a name occurs twice the later value
/// wins. Absent fields take their zero value and unknown ones are ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileDescriptor {
    /// Display name, not guaranteed unique or filesystem-safe.
    pub file_name: String,

    /// Optional `/`-separated logical sub-path.
    pub folder: String,

    /// Key of the backing object in the content store (`S3Path`).
    pub object_path: String,

    pub file_id: i64,

    /// `0` means the file is not grouped under a project.
    pub project_id: i64,

    pub project_name: String,

    /// Raw modification timestamp as stored (`Modified`), possibly empty.
    pub modified_at: String,

    /// Parsed form of `modified_at`, set by the resolver when it parses.
    pub modified_time: Option<DateTime<Utc>>,
}

impl<'de> Deserialize<'de> for FileDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(DescriptorVisitor)
    }
}

struct DescriptorVisitor;

impl<'de> Visitor<'de> for DescriptorVisitor {
    type Value = FileDescriptor;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a file descriptor object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut file = FileDescriptor::default();
        while let Some(key) = map.next_key::<String>()? {
            match key.to_ascii_lowercase().as_str() {
                "filename" => file.file_name = map.next_value::<Text>()?.0,
                "folder" => file.folder = map.next_value::<Text>()?.0,
                "s3path" | "objectpath" => file.object_path = map.next_value::<Text>()?.0,
                "fileid" => file.file_id = map.next_value::<Id>()?.0,
                "projectid" => file.project_id = map.next_value::<Id>()?.0,
                "projectname" => file.project_name = map.next_value::<Text>()?.0,
                "modified" => file.modified_at = map.next_value::<Text>()?.0,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(file)
    }
}

/// A string field where `null` reads as empty.
struct Text(String);

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Text(Option::<String>::deserialize(deserializer)?.unwrap_or_default()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

/// Ids travel as JSON strings; bare numbers are tolerated, empty means zero.
struct Id(i64);

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<IntOrString>::deserialize(deserializer)? {
            None => Ok(Id(0)),
            Some(IntOrString::Int(value)) => Ok(Id(value)),
            Some(IntOrString::Str(value)) if value.trim().is_empty() => Ok(Id(0)),
            Some(IntOrString::Str(value)) => value
                .trim()
                .parse()
                .map(Id)
                .map_err(|_| de::Error::custom(format!("invalid integer id `{}`", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pascal_case_record() {
        let raw = r#"[{"S3Path":"1/p23216.tf_A89A.pdf","FileVersionId":"4164","FileName":"Avis Rent A Car_ Print Reservation.pdf","ProjectName":"Superman","ProjectID":"23216","Folder":"","FileID":"4169"}]"#;
        let files: Vec<FileDescriptor> = serde_json::from_str(raw).unwrap();

        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.file_name, "Avis Rent A Car_ Print Reservation.pdf");
        assert_eq!(file.object_path, "1/p23216.tf_A89A.pdf");
        assert_eq!(file.file_id, 4169);
        assert_eq!(file.project_id, 23216);
        assert_eq!(file.project_name, "Superman");
        assert!(file.modified_at.is_empty());
        assert!(file.modified_time.is_none());
    }

    #[test]
    fn decodes_camel_case_record_with_numeric_ids() {
        let raw = r#"{"fileName":"a1.jpg","folder":"Level 1","objectPath":"k/a1.jpg","fileID":7,"projectID":"","projectName":null,"modified":"2015-07-18T02:05:04Z"}"#;
        let file: FileDescriptor = serde_json::from_str(raw).unwrap();

        assert_eq!(file.file_name, "a1.jpg");
        assert_eq!(file.folder, "Level 1");
        assert_eq!(file.object_path, "k/a1.jpg");
        assert_eq!(file.file_id, 7);
        assert_eq!(file.project_id, 0);
        assert_eq!(file.project_name, "");
        assert_eq!(file.modified_at, "2015-07-18T02:05:04Z");
    }

    #[test]
    fn rejects_non_numeric_ids() {
        let raw = r#"{"FileName":"a","FileID":"abc"}"#;
        let err = serde_json::from_str::<FileDescriptor>(raw).unwrap_err();
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn field_names_ignore_case_and_later_duplicates_win() {
        let raw = r#"{"FileName":"first.pdf","fileName":"second.pdf","S3Path":"k/old","objectPath":"k/new","PROJECTID":"5","projectname":"Apollo"}"#;
        let file: FileDescriptor = serde_json::from_str(raw).unwrap();

        assert_eq!(file.file_name, "second.pdf");
        assert_eq!(file.object_path, "k/new");
        assert_eq!(file.project_id, 5);
        assert_eq!(file.project_name, "Apollo");
    }

    #[test]
    fn non_object_entries_are_rejected() {
        assert!(serde_json::from_str::<Vec<FileDescriptor>>(r#"["a.pdf"]"#).is_err());
    }
}
