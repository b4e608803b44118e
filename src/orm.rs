#[allow(warnings, clippy::all)]
pub(crate) mod post {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "posts")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub description: String,
        pub image: Option<String>,
        pub created_at: TimeUnixTimestamp,
        pub expires_at: TimeUnixTimestamp,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
