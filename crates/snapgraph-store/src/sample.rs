//! Art gallery sample mapping
//!
//! Small schema exercising every mapping feature: generated and compound
//! keys, optimistic locking, to-one/to-many pairs, a join-table
//! relationship, a self-referential hierarchy and single-table
//! inheritance.
//!
//! | entity | table | key |
//! |---|---|---|
//! | `Artist` | `ARTIST` | `ARTIST_ID` (generated), locked on `ARTIST_NAME` |
//! | `Painting` | `PAINTING` | `PAINTING_ID` (generated) |
//! | `Gallery` | `GALLERY` | `GALLERY_ID` (generated) |
//! | `Exhibit` | `EXHIBIT` | `EXHIBIT_ID` (generated) |
//! | `ArtistExhibit` | `ARTIST_EXHIBIT` | `ARTIST_ID` + `EXHIBIT_ID` |
//! | `ArtGroup` | `ARTGROUP` | `GROUP_ID` (generated); members in `ARTIST_GROUP` |
//! | `Person` / `Employee` / `Manager` | `PERSON` | `PERSON_ID` (generated), `PERSON_TYPE` discriminator |

use snapgraph_core::errors::Result;
use snapgraph_core::model::{DeleteRule, EntityDescriptor, EntityResolver, Relationship};

pub const ARTIST: &str = "ARTIST";
pub const PAINTING: &str = "PAINTING";
pub const GALLERY: &str = "GALLERY";
pub const EXHIBIT: &str = "EXHIBIT";
pub const ARTIST_EXHIBIT: &str = "ARTIST_EXHIBIT";
pub const ARTGROUP: &str = "ARTGROUP";
pub const ARTIST_GROUP: &str = "ARTIST_GROUP";
pub const PERSON: &str = "PERSON";

pub fn art_gallery_descriptors() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::new("Artist", ARTIST)
            .pk("ARTIST_ID")
            .generated_key()
            .locking_attribute("artistName", "ARTIST_NAME")
            .attribute("dateOfBirth", "DATE_OF_BIRTH")
            .relationship(
                Relationship::to_many("paintingArray", "Painting", [("ARTIST_ID", "ARTIST_ID")])
                    .reverse("toArtist")
                    .delete_rule(DeleteRule::Nullify),
            )
            .relationship(
                Relationship::to_many(
                    "artistExhibitArray",
                    "ArtistExhibit",
                    [("ARTIST_ID", "ARTIST_ID")],
                )
                .reverse("toArtist")
                .delete_rule(DeleteRule::Cascade),
            )
            .relationship(
                Relationship::flattened(
                    "groupArray",
                    "ArtGroup",
                    ARTIST_GROUP,
                    [("ARTIST_ID", "ARTIST_ID")],
                    [("GROUP_ID", "GROUP_ID")],
                )
                .reverse("artistArray")
                .delete_rule(DeleteRule::Nullify),
            ),
        EntityDescriptor::new("Painting", PAINTING)
            .pk("PAINTING_ID")
            .generated_key()
            .attribute("paintingTitle", "PAINTING_TITLE")
            .attribute("estimatedPrice", "ESTIMATED_PRICE")
            .relationship(
                Relationship::to_one("toArtist", "Artist", [("ARTIST_ID", "ARTIST_ID")])
                    .reverse("paintingArray"),
            )
            .relationship(
                Relationship::to_one("toGallery", "Gallery", [("GALLERY_ID", "GALLERY_ID")])
                    .reverse("paintingArray"),
            ),
        EntityDescriptor::new("Gallery", GALLERY)
            .pk("GALLERY_ID")
            .generated_key()
            .attribute("galleryName", "GALLERY_NAME")
            .relationship(
                Relationship::to_many("paintingArray", "Painting", [("GALLERY_ID", "GALLERY_ID")])
                    .reverse("toGallery")
                    .delete_rule(DeleteRule::Nullify),
            )
            .relationship(
                Relationship::to_many("exhibitArray", "Exhibit", [("GALLERY_ID", "GALLERY_ID")])
                    .reverse("toGallery")
                    .delete_rule(DeleteRule::Deny),
            ),
        EntityDescriptor::new("Exhibit", EXHIBIT)
            .pk("EXHIBIT_ID")
            .generated_key()
            .attribute("openingDate", "OPENING_DATE")
            .relationship(
                Relationship::to_one("toGallery", "Gallery", [("GALLERY_ID", "GALLERY_ID")])
                    .reverse("exhibitArray"),
            )
            .relationship(
                Relationship::to_many(
                    "artistExhibitArray",
                    "ArtistExhibit",
                    [("EXHIBIT_ID", "EXHIBIT_ID")],
                )
                .reverse("toExhibit")
                .delete_rule(DeleteRule::Cascade),
            ),
        EntityDescriptor::new("ArtistExhibit", ARTIST_EXHIBIT)
            .pk("ARTIST_ID")
            .pk("EXHIBIT_ID")
            .relationship(
                Relationship::to_one("toArtist", "Artist", [("ARTIST_ID", "ARTIST_ID")])
                    .reverse("artistExhibitArray"),
            )
            .relationship(
                Relationship::to_one("toExhibit", "Exhibit", [("EXHIBIT_ID", "EXHIBIT_ID")])
                    .reverse("artistExhibitArray"),
            ),
        EntityDescriptor::new("ArtGroup", ARTGROUP)
            .pk("GROUP_ID")
            .generated_key()
            .attribute("name", "NAME")
            .relationship(
                Relationship::flattened(
                    "artistArray",
                    "Artist",
                    ARTIST_GROUP,
                    [("GROUP_ID", "GROUP_ID")],
                    [("ARTIST_ID", "ARTIST_ID")],
                )
                .reverse("groupArray"),
            )
            .relationship(
                Relationship::to_one("toParentGroup", "ArtGroup", [("PARENT_GROUP_ID", "GROUP_ID")])
                    .reverse("childGroupsArray"),
            )
            .relationship(
                Relationship::to_many(
                    "childGroupsArray",
                    "ArtGroup",
                    [("GROUP_ID", "PARENT_GROUP_ID")],
                )
                .reverse("toParentGroup")
                .delete_rule(DeleteRule::Nullify),
            ),
        EntityDescriptor::new("Person", PERSON)
            .pk("PERSON_ID")
            .generated_key()
            .discriminator("PERSON_TYPE", "EP")
            .attribute("name", "NAME"),
        EntityDescriptor::subentity("Employee", "Person")
            .discriminator("PERSON_TYPE", "EE")
            .attribute("salary", "SALARY"),
        EntityDescriptor::subentity("Manager", "Employee").discriminator("PERSON_TYPE", "EM"),
    ]
}

/// Resolver over [`art_gallery_descriptors`]
///
/// # Errors
///
/// Returns `InvalidMapping` only if the sample itself is broken.
pub fn art_gallery() -> Result<EntityResolver> {
    EntityResolver::new(art_gallery_descriptors())
}
