#[cfg(test)]
pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rput_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

#[cfg(test)]
pub async fn setup_test_tree() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary source tree
    // <root>
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    // |- baz
    //    |- 3.txt
    //    |- 4.txt -> ../bar/2.txt
    let tmp_dir = create_temp_dir().await?;
    tokio::fs::write(tmp_dir.join("0.txt"), "0").await.unwrap();
    let bar_path = tmp_dir.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "2").await.unwrap();
    let baz_path = tmp_dir.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("3.txt"), "3").await.unwrap();
    tokio::fs::symlink("../bar/2.txt", baz_path.join("4.txt"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
    Ok(tmp_dir)
}
